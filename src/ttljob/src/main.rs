//! Row-level TTL job runner
//!
//! `ttljob run` seeds an in-memory table split into ranges, then runs one TTL
//! job over it and prints the metrics summary.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Args, Parser, Subcommand};
use common::cli::{CommonArgs, CommonCommands, utils};
use tokio_util::sync::CancellationToken;

use ttljob::types::{
    ColumnType, Datum, DescriptorVersion, IndexId, PrimaryKeyColumn, RowLevelTtl, TableDescriptor,
    TableId,
};
use ttljob::{
    InMemoryStore, JobExecContext, OrderedKeyCodec, RowLevelTtlResumer, TtlJobDetails,
};

#[derive(Parser)]
#[command(name = "ttljob")]
#[command(about = "Row-level TTL job - deletes expired rows range by range")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: TtlCommands,
}

#[derive(Subcommand)]
enum TtlCommands {
    /// Run one TTL job against a seeded in-memory table
    Run(RunArgs),

    #[command(flatten)]
    Common(CommonCommands),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, help = "Table identifier", default_value_t = 100)]
    table: u32,

    #[arg(long, help = "Rows to seed", default_value_t = 10_000)]
    rows: i64,

    #[arg(long, help = "Percentage of seeded rows already expired", default_value_t = 50)]
    expired_percent: u8,

    #[arg(long, help = "Number of ranges the table is split into", default_value_t = 8)]
    ranges: i64,

    #[arg(long, help = "Per-table select batch size override")]
    select_batch_size: Option<u64>,

    #[arg(long, help = "Per-table delete batch size override")]
    delete_batch_size: Option<u64>,

    #[arg(long, help = "Per-table range concurrency override")]
    range_concurrency: Option<u64>,

    #[arg(long, help = "Per-table delete rate limit override (rows/s)")]
    delete_rate_limit: Option<u64>,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

fn seed_store(args: &RunArgs) -> Result<InMemoryStore> {
    let store = InMemoryStore::new();
    let table = TableId(args.table);
    let ttl = RowLevelTtl {
        select_batch_size: args.select_batch_size.unwrap_or(0),
        delete_batch_size: args.delete_batch_size.unwrap_or(0),
        range_concurrency: args.range_concurrency.unwrap_or(0),
        delete_rate_limit: args.delete_rate_limit.unwrap_or(0),
        ..Default::default()
    };

    store
        .create_table(TableDescriptor {
            id: table,
            database: "defaultdb".to_string(),
            schema: "public".to_string(),
            name: "events".to_string(),
            version: DescriptorVersion(1),
            modification_time: Utc::now() - ChronoDuration::hours(1),
            primary_index: IndexId(1),
            primary_key: vec![PrimaryKeyColumn::ascending("id", ColumnType::Int)],
            ttl: Some(ttl),
        })
        .context("Failed to create table")?;

    let expired_every = match args.expired_percent.min(100) {
        0 => None,
        percent => Some(100 / i64::from(percent)),
    };
    let now = Utc::now();
    for id in 0..args.rows {
        let expired = expired_every.is_some_and(|every| id % every == 0);
        let expires_at = if expired {
            now - ChronoDuration::days(1)
        } else {
            now + ChronoDuration::days(1)
        };
        store
            .insert_row(table, vec![Datum::Int(id)], expires_at)
            .context("Failed to seed row")?;
    }

    store
        .split_at_table_boundaries(table)
        .context("Failed to split table boundaries")?;
    let ranges = args.ranges.max(1);
    let step = (args.rows / ranges).max(1);
    for split in (1..ranges).map(|i| i * step) {
        store
            .split_table_at(table, &[Datum::Int(split)])
            .context("Failed to split table")?;
    }

    log::info!(
        "Seeded table {} with {} rows across {} ranges",
        table,
        args.rows,
        ranges
    );
    Ok(store)
}

async fn run_job(args: RunArgs, config: common::Configuration) -> Result<()> {
    let store = seed_store(&args)?;
    let table = TableId(args.table);

    let ctx = JobExecContext::new(
        Arc::new(store.clone()),
        Arc::new(OrderedKeyCodec),
        config.ttl.clone(),
    );
    let resumer = RowLevelTtlResumer::new(TtlJobDetails {
        table_id: table,
        cutoff: Utc::now(),
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => signal_cancel.cancel(),
            Err(e) => log::warn!("Shutdown signal handler failed: {e}"),
        }
    });

    log::info!("Starting row-level TTL job {}", resumer.job_id());
    let result = resumer.run(&cancel, &ctx).await;

    for relation in ctx.metrics.relations() {
        if let Some(metrics) = ctx.metrics.get(&relation) {
            metrics.summary().log();
        }
    }

    let report = result.context("Row-level TTL job failed")?;
    log::info!(
        "Job {} deleted {} rows over {} ranges in {:?} ({} rows remain)",
        report.job_id,
        report.stats.rows_deleted,
        report.ranges_processed,
        report.duration,
        store.row_count(table).context("Failed to count rows")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command {
        TtlCommands::Common(command) => utils::handle_common_command(&command, &config),
        TtlCommands::Run(args) => run_job(args, config).await,
    }
}
