pub mod cli;
pub mod config;

pub use config::{Configuration, TtlConfig};
