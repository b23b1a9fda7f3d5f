//! Per-range select/delete loop.
//!
//! Each select and each delete sub-batch runs in its own transaction. The
//! loop ends once a select returns fewer rows than the select batch size.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::distributor::RangeHandler;
use crate::error::TtlJobError;
use crate::guard::{GuardPhase, SchemaGuard};
use crate::job::TtlJobSpec;
use crate::metrics::RelationMetrics;
use crate::query::{DeleteQueryBuilder, SelectQueryBuilder};
use crate::rate_limiter::DeleteRateLimiter;
use crate::store::TransactionalStore;
use crate::types::{Datums, RangeToProcess};

/// Work done on one or more ranges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeStats {
    pub select_iterations: usize,
    pub delete_batches: usize,
    pub rows_selected: u64,
    pub rows_deleted: u64,
}

impl RangeStats {
    pub fn merge(&mut self, other: RangeStats) {
        self.select_iterations += other.select_iterations;
        self.delete_batches += other.delete_batches;
        self.rows_selected += other.rows_selected;
        self.rows_deleted += other.rows_deleted;
    }
}

/// Runs the select/delete loop over single ranges.
pub struct RangeProcessor {
    store: Arc<dyn TransactionalStore>,
    spec: Arc<TtlJobSpec>,
    guard: SchemaGuard,
    rate_limiter: Arc<DeleteRateLimiter>,
    metrics: RelationMetrics,
    delete: DeleteQueryBuilder,
    cancel: CancellationToken,
}

impl RangeProcessor {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        spec: Arc<TtlJobSpec>,
        guard: SchemaGuard,
        rate_limiter: Arc<DeleteRateLimiter>,
        metrics: RelationMetrics,
        cancel: CancellationToken,
    ) -> Self {
        let delete = DeleteQueryBuilder::new(&spec);
        Self {
            store,
            spec,
            guard,
            rate_limiter,
            metrics,
            delete,
            cancel,
        }
    }

    pub async fn process_range(&self, range: &RangeToProcess) -> Result<RangeStats, TtlJobError> {
        let _active = self.metrics.track_active_range();
        let select = SelectQueryBuilder::new(&self.spec, range);
        let delete_batch_size = self.spec.settings.delete_batch_size.max(1);
        let mut stats = RangeStats::default();

        debug!(
            table = %self.spec.relation,
            range = %range,
            query = %select.sql(),
            "Processing range"
        );

        loop {
            let started = Instant::now();
            let selected = self
                .select_batch(&select, stats.select_iterations == 0)
                .await
                .map_err(TtlJobError::select)?;
            self.metrics
                .record_select(selected.len() as u64, started.elapsed());
            stats.select_iterations += 1;
            stats.rows_selected += selected.len() as u64;

            for batch in selected.chunks(delete_batch_size) {
                let started = Instant::now();
                let deleted = self
                    .delete_batch(batch)
                    .await
                    .map_err(TtlJobError::delete)?;
                self.metrics.record_delete(deleted, started.elapsed());
                stats.delete_batches += 1;
                stats.rows_deleted += deleted;
            }

            debug!(
                table = %self.spec.relation,
                range = %range,
                rows_selected = selected.len(),
                rows_deleted = stats.rows_deleted,
                "Finished select iteration"
            );

            if selected.len() < select.limit() {
                break;
            }
        }

        Ok(stats)
    }

    async fn select_batch(
        &self,
        select: &SelectQueryBuilder,
        check_schema: bool,
    ) -> Result<Vec<Datums>, TtlJobError> {
        let mut txn = self.store.begin(&self.cancel).await?;
        if check_schema {
            self.guard
                .check_in_txn(txn.as_mut(), GuardPhase::Select)
                .await?;
        }
        let rows = select.run(txn.as_mut()).await?;
        txn.commit().await?;
        Ok(rows)
    }

    async fn delete_batch(&self, rows: &[Datums]) -> Result<u64, TtlJobError> {
        let mut txn = self.store.begin(&self.cancel).await?;
        self.guard
            .check_in_txn(txn.as_mut(), GuardPhase::Delete)
            .await?;
        self.rate_limiter.acquire(rows.len(), &self.cancel).await?;
        debug!(
            table = %self.spec.relation,
            rows = rows.len(),
            query = %self.delete.sql(rows.len()),
            "Deleting expired rows"
        );
        let deleted = self.delete.run(txn.as_mut(), rows).await?;
        txn.commit().await?;
        Ok(deleted)
    }
}

#[async_trait]
impl RangeHandler for RangeProcessor {
    async fn process(&self, range: RangeToProcess) -> Result<RangeStats, TtlJobError> {
        self.process_range(&range).await
    }
}
