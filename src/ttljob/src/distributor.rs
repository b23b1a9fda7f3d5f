//! Bounded work queue feeding a fixed pool of range workers.
//!
//! The producer submits ranges through a channel whose capacity equals the
//! number of workers. A worker whose range fails keeps receiving and
//! discarding ranges until the queue is closed, so the producer never blocks
//! on a queue nobody reads.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TtlJobError;
use crate::metrics::RelationMetrics;
use crate::processor::RangeStats;
use crate::types::RangeToProcess;

/// Processes one range to completion.
#[async_trait]
pub trait RangeHandler: Send + Sync + 'static {
    async fn process(&self, range: RangeToProcess) -> Result<RangeStats, TtlJobError>;
}

/// Totals reported by the pool after the queue was closed and drained.
#[derive(Debug, Default)]
pub struct DistributorOutcome {
    pub stats: RangeStats,
    pub ranges_processed: usize,
    pub ranges_discarded: usize,
    /// Worker errors, oldest first.
    pub errors: Vec<TtlJobError>,
}

#[derive(Debug, Default)]
struct WorkerReport {
    stats: RangeStats,
    ranges_processed: usize,
    ranges_discarded: usize,
    error: Option<(Instant, TtlJobError)>,
}

pub struct WorkDistributor {
    sender: mpsc::Sender<RangeToProcess>,
    workers: JoinSet<WorkerReport>,
    cancel: CancellationToken,
}

impl WorkDistributor {
    /// Spawns `concurrency` workers sharing one queue of the same capacity.
    pub fn start(
        handler: Arc<dyn RangeHandler>,
        concurrency: usize,
        metrics: RelationMetrics,
        cancel: CancellationToken,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = mpsc::channel(concurrency);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = JoinSet::new();
        for worker in 0..concurrency {
            workers.spawn(run_worker(
                worker,
                Arc::clone(&receiver),
                Arc::clone(&handler),
                metrics.clone(),
            ));
        }

        Self {
            sender,
            workers,
            cancel,
        }
    }

    /// Queues a range, waiting for capacity. Fails only on cancellation.
    pub async fn submit(&self, range: RangeToProcess) -> Result<(), TtlJobError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TtlJobError::Cancelled),
            sent = self.sender.send(range) => sent.map_err(|_| {
                TtlJobError::Worker("range queue closed before the producer finished".to_string())
            }),
        }
    }

    /// Closes the queue and waits for every worker to drain it.
    pub async fn finish(self) -> DistributorOutcome {
        let Self {
            sender,
            mut workers,
            ..
        } = self;
        drop(sender);

        let mut outcome = DistributorOutcome::default();
        let mut errors = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(report) => {
                    outcome.stats.merge(report.stats);
                    outcome.ranges_processed += report.ranges_processed;
                    outcome.ranges_discarded += report.ranges_discarded;
                    errors.extend(report.error);
                }
                Err(err) => errors.push((Instant::now(), TtlJobError::Worker(err.to_string()))),
            }
        }

        errors.sort_by_key(|(at, _)| *at);
        outcome.errors = errors.into_iter().map(|(_, err)| err).collect();
        outcome
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<RangeToProcess>>>,
    handler: Arc<dyn RangeHandler>,
    metrics: RelationMetrics,
) -> WorkerReport {
    let mut report = WorkerReport::default();

    loop {
        let next = receiver.lock().await.recv().await;
        let Some(range) = next else {
            break;
        };

        if report.error.is_some() {
            debug!(worker, range = %range, "Discarding range after earlier failure");
            report.ranges_discarded += 1;
            continue;
        }

        let description = range.to_string();
        let started = Instant::now();
        let result = handler.process(range).await;
        metrics.record_range(started.elapsed());

        match result {
            Ok(stats) => {
                debug!(
                    worker,
                    range = %description,
                    rows_deleted = stats.rows_deleted,
                    "Range processed"
                );
                report.stats.merge(stats);
                report.ranges_processed += 1;
            }
            Err(err) => {
                warn!(worker, range = %description, error = %err, "Range processing failed");
                report.error = Some((Instant::now(), err));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RowLevelTtlMetrics;
    use crate::types::Datum;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Records processed ranges, failing those listed in `fail`.
    #[derive(Default)]
    struct RecordingHandler {
        seen: StdMutex<Vec<u64>>,
        fail: HashSet<u64>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RangeHandler for RecordingHandler {
        async fn process(&self, range: RangeToProcess) -> Result<RangeStats, TtlJobError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen.lock().unwrap().push(range.range_id);
            if self.fail.contains(&range.range_id) {
                return Err(TtlJobError::Worker(format!("range {} failed", range.range_id)));
            }
            Ok(RangeStats {
                select_iterations: 1,
                rows_deleted: 1,
                ..Default::default()
            })
        }
    }

    fn range(id: u64) -> RangeToProcess {
        RangeToProcess {
            range_id: id,
            start_pk: vec![Datum::Int(id as i64)],
            end_pk: vec![Datum::Int(id as i64 + 1)],
        }
    }

    fn metrics() -> RelationMetrics {
        RowLevelTtlMetrics::new().load("t")
    }

    #[tokio::test]
    async fn test_every_range_processed_exactly_once() {
        let handler = Arc::new(RecordingHandler {
            delay: Some(Duration::from_millis(1)),
            ..Default::default()
        });
        let metrics = metrics();
        let distributor =
            WorkDistributor::start(handler.clone(), 4, metrics.clone(), CancellationToken::new());

        for id in 0..50 {
            distributor.submit(range(id)).await.unwrap();
        }
        let outcome = distributor.finish().await;

        let mut seen = handler.seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
        assert_eq!(outcome.ranges_processed, 50);
        assert_eq!(outcome.stats.rows_deleted, 50);
        assert!(outcome.errors.is_empty());
        assert_eq!(metrics.ranges_processed(), 50);
    }

    #[tokio::test]
    async fn test_failed_worker_drains_queue() {
        let handler = Arc::new(RecordingHandler {
            fail: HashSet::from([0]),
            ..Default::default()
        });
        let distributor =
            WorkDistributor::start(handler.clone(), 1, metrics(), CancellationToken::new());

        // A single worker with a queue of one: without draining, the third
        // submit would block forever.
        for id in 0..10 {
            distributor.submit(range(id)).await.unwrap();
        }
        let outcome = tokio::time::timeout(Duration::from_secs(5), distributor.finish())
            .await
            .unwrap();

        assert_eq!(handler.seen.lock().unwrap().as_slice(), &[0]);
        assert_eq!(outcome.ranges_processed, 0);
        assert_eq!(outcome.ranges_discarded, 9);
        assert_eq!(
            outcome.errors,
            vec![TtlJobError::Worker("range 0 failed".to_string())]
        );
    }

    #[tokio::test]
    async fn test_errors_from_several_workers_are_collected() {
        let handler = Arc::new(RecordingHandler {
            fail: HashSet::from([0, 1]),
            delay: Some(Duration::from_millis(5)),
            ..Default::default()
        });
        let distributor =
            WorkDistributor::start(handler.clone(), 2, metrics(), CancellationToken::new());

        for id in 0..6 {
            distributor.submit(range(id)).await.unwrap();
        }
        let outcome = distributor.finish().await;

        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(
            outcome.ranges_processed + outcome.ranges_discarded + outcome.errors.len(),
            6
        );
    }

    #[tokio::test]
    async fn test_submit_unblocks_on_cancel() {
        let handler = Arc::new(RecordingHandler {
            delay: Some(Duration::from_secs(60)),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let distributor = WorkDistributor::start(handler, 1, metrics(), cancel.clone());

        // One range in flight, one queued, the third waits for capacity.
        distributor.submit(range(0)).await.unwrap();
        distributor.submit(range(1)).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = distributor.submit(range(2)).await.unwrap_err();

        assert_eq!(err, TtlJobError::Cancelled);
    }
}
