use common::TtlConfig;

use crate::error::TtlJobError;
use crate::types::RowLevelTtl;

/// Upper bound on the worker pool of a single job.
pub const MAX_RANGE_CONCURRENCY: usize = 1024;

/// Effective batch sizes and limits of one job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSettings {
    pub select_batch_size: usize,
    pub delete_batch_size: usize,
    pub range_concurrency: usize,
    /// Rows per second across all workers, 0 means unlimited.
    pub delete_rate_limit: u64,
    pub range_batch_size: usize,
}

impl JobSettings {
    /// Table settings win over the cluster defaults when non-zero.
    pub fn resolve(config: &TtlConfig, table: &RowLevelTtl) -> Result<Self, TtlJobError> {
        let settings = Self {
            select_batch_size: to_usize(
                "select batch size",
                pick(table.select_batch_size, config.default_select_batch_size),
            )?,
            delete_batch_size: to_usize(
                "delete batch size",
                pick(table.delete_batch_size, config.default_delete_batch_size),
            )?,
            range_concurrency: to_usize(
                "range concurrency",
                pick(table.range_concurrency, config.default_range_concurrency),
            )?,
            delete_rate_limit: pick(table.delete_rate_limit, config.default_delete_rate_limit),
            range_batch_size: to_usize("range batch size", config.range_batch_size)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), TtlJobError> {
        let checks = [
            ("select batch size", self.select_batch_size),
            ("delete batch size", self.delete_batch_size),
            ("range concurrency", self.range_concurrency),
            ("range batch size", self.range_batch_size),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(TtlJobError::InvalidSettings(format!(
                    "{name} must be positive"
                )));
            }
        }
        if self.range_concurrency > MAX_RANGE_CONCURRENCY {
            return Err(TtlJobError::InvalidSettings(format!(
                "range concurrency {} exceeds the maximum of {MAX_RANGE_CONCURRENCY}",
                self.range_concurrency
            )));
        }
        Ok(())
    }
}

fn pick(table_value: u64, default: u64) -> u64 {
    if table_value != 0 { table_value } else { default }
}

fn to_usize(name: &str, value: u64) -> Result<usize, TtlJobError> {
    usize::try_from(value)
        .map_err(|_| TtlJobError::InvalidSettings(format!("{name} {value} is too large")))
}
