//! Row-level TTL metrics
//!
//! One [`RelationMetrics`] record per table, created lazily by the
//! [`RowLevelTtlMetrics`] registry and shared by every worker of a job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Replaces every character outside `[a-zA-Z0-9_]` with `_`.
pub fn sanitize_label(relation: &str) -> String {
    relation
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Registry of per-relation metrics.
#[derive(Debug, Clone, Default)]
pub struct RowLevelTtlMetrics {
    relations: Arc<Mutex<HashMap<String, RelationMetrics>>>,
}

impl RowLevelTtlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record of `relation`, creating it on first use.
    pub fn load(&self, relation: &str) -> RelationMetrics {
        let key = sanitize_label(relation);
        let mut relations = self
            .relations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        relations
            .entry(key.clone())
            .or_insert_with(|| RelationMetrics::new(key))
            .clone()
    }

    pub fn get(&self, relation: &str) -> Option<RelationMetrics> {
        let relations = self
            .relations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        relations.get(&sanitize_label(relation)).cloned()
    }

    /// Sanitized names of every relation with a record.
    pub fn relations(&self) -> Vec<String> {
        let relations = self
            .relations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = relations.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Thread-safe metrics of one relation
#[derive(Debug, Clone)]
pub struct RelationMetrics {
    inner: Arc<RelationMetricsInner>,
}

#[derive(Debug)]
struct RelationMetricsInner {
    relation: String,
    rows_selected: AtomicU64,
    rows_deleted: AtomicU64,
    ranges_processed: AtomicU64,
    active_ranges: AtomicI64,
    select_duration: DurationHistogram,
    delete_duration: DurationHistogram,
    range_total_duration: DurationHistogram,
}

impl RelationMetrics {
    fn new(relation: String) -> Self {
        Self {
            inner: Arc::new(RelationMetricsInner {
                relation,
                rows_selected: AtomicU64::new(0),
                rows_deleted: AtomicU64::new(0),
                ranges_processed: AtomicU64::new(0),
                active_ranges: AtomicI64::new(0),
                select_duration: DurationHistogram::default(),
                delete_duration: DurationHistogram::default(),
                range_total_duration: DurationHistogram::default(),
            }),
        }
    }

    /// Record one select statement
    pub fn record_select(&self, rows: u64, duration: Duration) {
        self.inner.rows_selected.fetch_add(rows, Ordering::Relaxed);
        self.inner.select_duration.record(duration);
    }

    /// Record one delete sub-batch
    pub fn record_delete(&self, rows: u64, duration: Duration) {
        self.inner.rows_deleted.fetch_add(rows, Ordering::Relaxed);
        self.inner.delete_duration.record(duration);
    }

    /// Record the wall-clock time a worker spent on one range
    pub fn record_range(&self, duration: Duration) {
        self.inner.ranges_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.range_total_duration.record(duration);
    }

    /// Increments the active range gauge until the guard is dropped.
    pub fn track_active_range(&self) -> ActiveRangeGuard {
        self.inner.active_ranges.fetch_add(1, Ordering::Relaxed);
        ActiveRangeGuard {
            metrics: self.clone(),
        }
    }

    pub fn rows_selected(&self) -> u64 {
        self.inner.rows_selected.load(Ordering::Relaxed)
    }

    pub fn rows_deleted(&self) -> u64 {
        self.inner.rows_deleted.load(Ordering::Relaxed)
    }

    pub fn ranges_processed(&self) -> u64 {
        self.inner.ranges_processed.load(Ordering::Relaxed)
    }

    pub fn active_ranges(&self) -> i64 {
        self.inner.active_ranges.load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> RowLevelTtlMetricsSummary {
        RowLevelTtlMetricsSummary {
            relation: self.inner.relation.clone(),
            rows_selected: self.rows_selected(),
            rows_deleted: self.rows_deleted(),
            ranges_processed: self.ranges_processed(),
            active_ranges: self.active_ranges(),
            select_duration: self.inner.select_duration.snapshot(),
            delete_duration: self.inner.delete_duration.snapshot(),
            range_total_duration: self.inner.range_total_duration.snapshot(),
        }
    }
}

/// Decrements the active range gauge on drop, error paths included.
#[derive(Debug)]
pub struct ActiveRangeGuard {
    metrics: RelationMetrics,
}

impl Drop for ActiveRangeGuard {
    fn drop(&mut self) {
        self.metrics
            .inner
            .active_ranges
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Nanosecond duration histogram reduced to count, sum, min and max.
#[derive(Debug)]
pub struct DurationHistogram {
    count: AtomicU64,
    sum_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }
}

impl DurationHistogram {
    pub fn record(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        HistogramSnapshot {
            count,
            sum_ns: self.sum_ns.load(Ordering::Relaxed),
            min_ns: if count == 0 {
                0
            } else {
                self.min_ns.load(Ordering::Relaxed)
            },
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

impl HistogramSnapshot {
    pub fn mean_ms(&self) -> f64 {
        if self.count > 0 {
            self.sum_ns as f64 / self.count as f64 / 1_000_000.0
        } else {
            0.0
        }
    }
}

/// Snapshot of one relation's metrics at a point in time
#[derive(Debug, Clone)]
pub struct RowLevelTtlMetricsSummary {
    pub relation: String,
    pub rows_selected: u64,
    pub rows_deleted: u64,
    pub ranges_processed: u64,
    pub active_ranges: i64,
    pub select_duration: HistogramSnapshot,
    pub delete_duration: HistogramSnapshot,
    pub range_total_duration: HistogramSnapshot,
}

impl RowLevelTtlMetricsSummary {
    /// Log the metrics summary
    pub fn log(&self) {
        log::info!("=== Row-Level TTL Metrics: {} ===", self.relation);
        log::info!(
            "Rows: {} selected, {} deleted",
            self.rows_selected,
            self.rows_deleted
        );
        log::info!(
            "Ranges: {} processed, {} active",
            self.ranges_processed,
            self.active_ranges
        );
        log::info!(
            "Selects: {} ({:.2}ms avg), deletes: {} ({:.2}ms avg), ranges: {:.2}ms avg",
            self.select_duration.count,
            self.select_duration.mean_ms(),
            self.delete_duration.count,
            self.delete_duration.mean_ms(),
            self.range_total_duration.mean_ms()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("defaultdb.public.events"), "defaultdb_public_events");
        assert_eq!(sanitize_label("db.\"my-table\""), "db__my_table_");
        assert_eq!(sanitize_label("already_ok_123"), "already_ok_123");
    }

    #[test]
    fn test_registry_shares_records_per_relation() {
        let registry = RowLevelTtlMetrics::new();
        let a = registry.load("db.public.t");
        let b = registry.load("db.public.t");
        a.record_delete(5, Duration::from_millis(1));
        b.record_delete(7, Duration::from_millis(1));

        assert_eq!(a.rows_deleted(), 12);
        assert_eq!(registry.relations(), vec!["db_public_t".to_string()]);
        assert_eq!(registry.get("db.public.t").unwrap().rows_deleted(), 12);
        assert!(registry.get("db.public.other").is_none());
    }

    #[test]
    fn test_histogram_snapshot() {
        let histogram = DurationHistogram::default();
        assert_eq!(histogram.snapshot(), HistogramSnapshot::default());

        histogram.record(Duration::from_millis(2));
        histogram.record(Duration::from_millis(4));
        let snapshot = histogram.snapshot();

        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.min_ns, 2_000_000);
        assert_eq!(snapshot.max_ns, 4_000_000);
        assert!((snapshot.mean_ms() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_active_range_guard() {
        let metrics = RowLevelTtlMetrics::new().load("t");
        {
            let _first = metrics.track_active_range();
            let _second = metrics.track_active_range();
            assert_eq!(metrics.active_ranges(), 2);
        }
        assert_eq!(metrics.active_ranges(), 0);
    }

    #[test]
    fn test_summary() {
        let metrics = RowLevelTtlMetrics::new().load("t");
        metrics.record_select(100, Duration::from_millis(3));
        metrics.record_delete(60, Duration::from_millis(1));
        metrics.record_range(Duration::from_millis(10));

        let summary = metrics.summary();
        assert_eq!(summary.relation, "t");
        assert_eq!(summary.rows_selected, 100);
        assert_eq!(summary.rows_deleted, 60);
        assert_eq!(summary.ranges_processed, 1);
        assert_eq!(summary.select_duration.count, 1);
        summary.log();
    }
}
