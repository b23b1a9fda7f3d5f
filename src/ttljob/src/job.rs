//! Row-level TTL job driver
//!
//! Captures the job spec in one transaction, then runs range discovery as the
//! producer of a [`WorkDistributor`] whose workers run the per-range
//! select/delete loop. The job succeeds only if the producer and every
//! worker succeed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TtlConfig;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::discovery::RangeDiscoverer;
use crate::distributor::WorkDistributor;
use crate::error::TtlJobError;
use crate::guard::SchemaGuard;
use crate::keys::KeyDecoder;
use crate::metrics::RowLevelTtlMetrics;
use crate::processor::{RangeProcessor, RangeStats};
use crate::rate_limiter::DeleteRateLimiter;
use crate::settings::JobSettings;
use crate::store::TransactionalStore;
use crate::types::{DescriptorVersion, IndexId, PrimaryKeyColumn, Span, TableId};

/// Overrides used by tests.
#[derive(Debug, Clone, Default)]
pub struct TtlTestingKnobs {
    /// Replaces the configured AOST duration.
    pub aost_duration: Option<Duration>,
    /// Version reported to the schema guard before every delete.
    pub mock_descriptor_version_during_delete: Option<DescriptorVersion>,
}

/// Persisted job payload: which table to clean up, and the expiration cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlJobDetails {
    pub table_id: TableId,
    pub cutoff: DateTime<Utc>,
}

/// Everything a job run reads from the table and the configuration, fixed
/// at job start.
#[derive(Debug, Clone)]
pub struct TtlJobSpec {
    pub table_id: TableId,
    /// Fully-qualified `database.schema.table` name.
    pub relation: String,
    pub cutoff: DateTime<Utc>,
    pub aost: DateTime<Utc>,
    pub primary_index: IndexId,
    pub primary_key: Vec<PrimaryKeyColumn>,
    pub expiration_column: String,
    pub settings: JobSettings,
    /// Key span of the primary index.
    pub span: Span,
    /// Descriptor version the job validated.
    pub version: DescriptorVersion,
}

/// Collaborators handed to a job by the scheduling framework.
#[derive(Clone)]
pub struct JobExecContext {
    pub store: Arc<dyn TransactionalStore>,
    pub keys: Arc<dyn KeyDecoder>,
    pub config: TtlConfig,
    pub metrics: RowLevelTtlMetrics,
    pub knobs: TtlTestingKnobs,
}

impl JobExecContext {
    pub fn new(
        store: Arc<dyn TransactionalStore>,
        keys: Arc<dyn KeyDecoder>,
        config: TtlConfig,
    ) -> Self {
        Self {
            store,
            keys,
            config,
            metrics: RowLevelTtlMetrics::new(),
            knobs: TtlTestingKnobs::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: RowLevelTtlMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_knobs(mut self, knobs: TtlTestingKnobs) -> Self {
        self.knobs = knobs;
        self
    }
}

/// Contract between the scheduling framework and a job implementation.
///
/// The framework owns retries: a failed `resume` is re-attempted as a whole.
#[async_trait]
pub trait JobResumer: Send + Sync {
    async fn resume(
        &self,
        cancel: &CancellationToken,
        ctx: &JobExecContext,
    ) -> Result<(), TtlJobError>;

    async fn on_fail_or_cancel(
        &self,
        cancel: &CancellationToken,
        ctx: &JobExecContext,
    ) -> Result<(), TtlJobError>;
}

/// Outcome of a successful run
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub relation: String,
    pub ranges_discovered: usize,
    pub ranges_processed: usize,
    pub metadata_scans: usize,
    pub stats: RangeStats,
    pub duration: Duration,
}

/// The row-level TTL job.
#[derive(Debug, Clone)]
pub struct RowLevelTtlResumer {
    job_id: Uuid,
    details: TtlJobDetails,
}

impl RowLevelTtlResumer {
    pub fn new(details: TtlJobDetails) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            details,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn details(&self) -> &TtlJobDetails {
        &self.details
    }

    /// Runs the job to completion and reports what was done.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        ctx: &JobExecContext,
    ) -> Result<JobReport, TtlJobError> {
        let started = Instant::now();
        let aost_duration = ctx.knobs.aost_duration.unwrap_or(ctx.config.aost_duration);
        let aost_duration = chrono::Duration::from_std(aost_duration)
            .map_err(|err| TtlJobError::InvalidSettings(format!("AOST duration: {err}")))?;
        let aost = Utc::now() - aost_duration;

        let spec = Arc::new(capture_spec(ctx, &self.details, aost, cancel).await?);

        info!(
            job_id = %self.job_id,
            table = %spec.relation,
            cutoff = %spec.cutoff.to_rfc3339(),
            aost = %spec.aost.to_rfc3339(),
            version = %spec.version,
            select_batch_size = spec.settings.select_batch_size,
            delete_batch_size = spec.settings.delete_batch_size,
            range_concurrency = spec.settings.range_concurrency,
            delete_rate_limit = spec.settings.delete_rate_limit,
            "Starting row-level TTL job"
        );

        let metrics = ctx.metrics.load(&spec.relation);
        let guard = SchemaGuard::new(spec.table_id, spec.relation.clone(), spec.version)
            .with_mock_version_during_delete(ctx.knobs.mock_descriptor_version_during_delete);
        let rate_limiter = Arc::new(DeleteRateLimiter::new(spec.settings.delete_rate_limit));
        let processor = Arc::new(RangeProcessor::new(
            Arc::clone(&ctx.store),
            Arc::clone(&spec),
            guard,
            rate_limiter,
            metrics.clone(),
            cancel.clone(),
        ));

        let distributor = WorkDistributor::start(
            processor,
            spec.settings.range_concurrency,
            metrics,
            cancel.clone(),
        );
        let mut discoverer = RangeDiscoverer::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.keys),
            &spec,
            cancel.clone(),
        );

        let mut ranges_discovered = 0;
        let produced: Result<(), TtlJobError> = async {
            while let Some(range) = discoverer.next().await? {
                distributor.submit(range).await?;
                ranges_discovered += 1;
            }
            Ok(())
        }
        .await;
        let outcome = distributor.finish().await;

        let mut errors = Vec::new();
        if let Err(err) = produced {
            errors.push(err);
        }
        errors.extend(outcome.errors);

        if let Some(err) = TtlJobError::combine(errors) {
            let err = if cancel.is_cancelled() {
                TtlJobError::Cancelled
            } else {
                err
            };
            warn!(
                job_id = %self.job_id,
                table = %spec.relation,
                ranges_discovered,
                ranges_processed = outcome.ranges_processed,
                rows_deleted = outcome.stats.rows_deleted,
                error = %err,
                "Row-level TTL job failed"
            );
            return Err(err);
        }

        let report = JobReport {
            job_id: self.job_id,
            relation: spec.relation.clone(),
            ranges_discovered,
            ranges_processed: outcome.ranges_processed,
            metadata_scans: discoverer.scans(),
            stats: outcome.stats,
            duration: started.elapsed(),
        };
        info!(
            job_id = %self.job_id,
            table = %report.relation,
            ranges = report.ranges_processed,
            rows_selected = report.stats.rows_selected,
            rows_deleted = report.stats.rows_deleted,
            duration_ms = report.duration.as_millis() as u64,
            "Row-level TTL job completed"
        );
        Ok(report)
    }
}

#[async_trait]
impl JobResumer for RowLevelTtlResumer {
    async fn resume(
        &self,
        cancel: &CancellationToken,
        ctx: &JobExecContext,
    ) -> Result<(), TtlJobError> {
        self.run(cancel, ctx).await.map(|_| ())
    }

    async fn on_fail_or_cancel(
        &self,
        _cancel: &CancellationToken,
        _ctx: &JobExecContext,
    ) -> Result<(), TtlJobError> {
        Ok(())
    }
}

/// Reads the table descriptor and freezes the job parameters.
pub async fn capture_spec(
    ctx: &JobExecContext,
    details: &TtlJobDetails,
    aost: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<TtlJobSpec, TtlJobError> {
    let mut txn = ctx.store.begin(cancel).await?;
    let desc = txn.table_descriptor(details.table_id).await?;
    txn.commit().await?;

    if desc.modification_time > aost {
        return Err(TtlJobError::RecentSchemaChange {
            changed_at: desc.modification_time.to_rfc3339(),
        });
    }

    let relation = desc.qualified_name();
    let ttl = desc.ttl.as_ref().ok_or_else(|| TtlJobError::MissingTtl {
        table: relation.clone(),
    })?;
    let settings = JobSettings::resolve(&ctx.config, ttl)?;
    let span = ctx.keys.primary_index_span(desc.id, desc.primary_index);

    Ok(TtlJobSpec {
        table_id: desc.id,
        relation,
        cutoff: details.cutoff,
        aost,
        primary_index: desc.primary_index,
        expiration_column: ttl.expiration_column.clone(),
        settings,
        span,
        version: desc.version,
        primary_key: desc.primary_key,
    })
}
