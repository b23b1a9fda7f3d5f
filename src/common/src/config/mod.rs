use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "ttljob.toml";

/// Environment variable prefix, nested keys are separated by `__`.
///
/// Example: `TTLJOB__TTL__DEFAULT_SELECT_BATCH_SIZE=1000`
pub const ENV_PREFIX: &str = "TTLJOB__";

/// Cluster-wide defaults for row-level TTL jobs.
///
/// Every batch/concurrency/rate option can be overridden per table; the
/// table setting wins whenever it is non-zero.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlConfig {
    /// Rows fetched per select iteration when the table has no override.
    ///
    /// Env: TTLJOB__TTL__DEFAULT_SELECT_BATCH_SIZE
    #[serde(default = "default_select_batch_size")]
    pub default_select_batch_size: u64,

    /// Rows deleted per delete transaction when the table has no override.
    ///
    /// Env: TTLJOB__TTL__DEFAULT_DELETE_BATCH_SIZE
    #[serde(default = "default_delete_batch_size")]
    pub default_delete_batch_size: u64,

    /// Number of ranges processed at once when the table has no override.
    ///
    /// Env: TTLJOB__TTL__DEFAULT_RANGE_CONCURRENCY
    #[serde(default = "default_range_concurrency")]
    pub default_range_concurrency: u64,

    /// Rows per second deleted across all workers. Use 0 to signify no rate limit.
    ///
    /// Env: TTLJOB__TTL__DEFAULT_DELETE_RATE_LIMIT
    #[serde(default)]
    pub default_delete_rate_limit: u64,

    /// Number of ranges fetched per range metadata scan.
    ///
    /// Env: TTLJOB__TTL__RANGE_BATCH_SIZE
    #[serde(default = "default_range_batch_size")]
    pub range_batch_size: u64,

    /// How far behind "now" the historical reads of the job are taken.
    ///
    /// Env: TTLJOB__TTL__AOST_DURATION
    #[serde(with = "humantime_serde", default = "default_aost_duration")]
    pub aost_duration: Duration,
}

fn default_select_batch_size() -> u64 {
    500
}

fn default_delete_batch_size() -> u64 {
    100
}

fn default_range_concurrency() -> u64 {
    1
}

fn default_range_batch_size() -> u64 {
    100
}

fn default_aost_duration() -> Duration {
    Duration::from_secs(30)
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_select_batch_size: default_select_batch_size(),
            default_delete_batch_size: default_delete_batch_size(),
            default_range_concurrency: default_range_concurrency(),
            default_delete_rate_limit: 0, // unlimited
            range_batch_size: default_range_batch_size(),
            aost_duration: default_aost_duration(),
        }
    }
}

impl TtlConfig {
    /// Validate the TTL configuration.
    ///
    /// Batch sizes and concurrency must be positive. The delete rate limit may
    /// be zero, which disables throttling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("default_select_batch_size", self.default_select_batch_size),
            ("default_delete_batch_size", self.default_delete_batch_size),
            ("default_range_concurrency", self.default_range_concurrency),
            ("range_batch_size", self.range_batch_size),
        ];
        for (setting, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { setting });
            }
        }
        Ok(())
    }
}

/// Errors that can occur during configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {setting}: must be positive")]
    NotPositive { setting: &'static str },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Row-level TTL job defaults
    #[serde(default)]
    pub ttl: TtlConfig,
}

impl Configuration {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    pub fn load() -> Result<Self, ConfigError> {
        let config: Configuration = Self::figment()
            .merge(Toml::file(DEFAULT_CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.ttl.validate()?;

        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config: Configuration = Self::figment()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.ttl.validate()?;

        Ok(config)
    }
}
