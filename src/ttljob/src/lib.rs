//! Row-level TTL job engine.
//!
//! Finds rows whose expiration timestamp has passed and deletes them, range
//! by range, across a table partitioned into independently addressed key
//! ranges. See [`job::RowLevelTtlResumer`] for the entry point.

pub mod discovery;
pub mod distributor;
pub mod error;
pub mod guard;
pub mod job;
pub mod keys;
pub mod metrics;
pub mod processor;
pub mod query;
pub mod rate_limiter;
pub mod settings;
pub mod store;
pub mod types;

pub use error::TtlJobError;
pub use job::{
    JobExecContext, JobReport, JobResumer, RowLevelTtlResumer, TtlJobDetails, TtlJobSpec,
    TtlTestingKnobs,
};
pub use keys::{KeyDecoder, OrderedKeyCodec};
pub use metrics::RowLevelTtlMetrics;
pub use store::{InMemoryStore, Transaction, TransactionalStore};
