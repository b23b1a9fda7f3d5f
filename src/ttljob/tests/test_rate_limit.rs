mod fixtures;

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use ttljob::RowLevelTtlResumer;
use ttljob::types::RowLevelTtl;

use fixtures::{TableFixture, init_tracing};

/// Deleted rows stay within `rate * elapsed + burst` across all workers.
#[tokio::test]
async fn test_delete_throughput_is_bounded_job_wide() -> Result<()> {
    init_tracing();
    let rate: u64 = 200;
    let fixture = TableFixture::new(RowLevelTtl {
        select_batch_size: 100,
        delete_batch_size: 25,
        range_concurrency: 4,
        delete_rate_limit: rate,
        ..Default::default()
    })
    .expired_rows(0..300)
    .split_at(&[75, 150, 225]);

    let started = Instant::now();
    let report = RowLevelTtlResumer::new(fixture.details())
        .run(&CancellationToken::new(), &fixture.context())
        .await?;
    let elapsed = started.elapsed();

    assert_eq!(report.stats.rows_deleted, 300);
    // The bucket starts with one second worth of tokens, the remaining 100
    // rows need another half second.
    assert!(elapsed >= Duration::from_millis(400), "finished in {elapsed:?}");
    let bound = rate as f64 * elapsed.as_secs_f64() + rate as f64;
    assert!((report.stats.rows_deleted as f64) <= bound);
    Ok(())
}

#[tokio::test]
async fn test_zero_rate_limit_is_unthrottled() -> Result<()> {
    let fixture = TableFixture::new(RowLevelTtl {
        select_batch_size: 500,
        delete_batch_size: 100,
        range_concurrency: 1,
        delete_rate_limit: 0,
        ..Default::default()
    })
    .expired_rows(0..2_000);

    let started = Instant::now();
    let report = RowLevelTtlResumer::new(fixture.details())
        .run(&CancellationToken::new(), &fixture.context())
        .await?;

    assert_eq!(report.stats.rows_deleted, 2_000);
    assert!(started.elapsed() < Duration::from_secs(5));
    Ok(())
}
