use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Common subcommands available for all binaries
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Log level derived from the verbosity flags
    pub fn log_level(args: &CommonArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments
    ///
    /// `RUST_LOG` still takes precedence when it is set.
    pub fn init_logging(args: &CommonArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));

        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("TTL Job Configuration:");
            println!("======================");
            println!(
                "Default select batch size: {}",
                config.ttl.default_select_batch_size
            );
            println!(
                "Default delete batch size: {}",
                config.ttl.default_delete_batch_size
            );
            println!(
                "Default range concurrency: {}",
                config.ttl.default_range_concurrency
            );
            if config.ttl.default_delete_rate_limit == 0 {
                println!("Default delete rate limit: unlimited");
            } else {
                println!(
                    "Default delete rate limit: {} rows/s",
                    config.ttl.default_delete_rate_limit
                );
            }
            println!("Range batch size: {}", config.ttl.range_batch_size);
            println!("AOST duration: {:?}", config.ttl.aost_duration);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        config
            .ttl
            .validate()
            .context("Invalid TTL configuration")?;

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle common CLI commands
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
