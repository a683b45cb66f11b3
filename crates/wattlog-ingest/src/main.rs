//! Wattlog ingestion daemon.
//!
//! This is the main entry point for the event ingestion service. It watches
//! the control loop's export directory, decodes and deduplicates event
//! files, commits them to the SQLite store, and keeps both the store and
//! the filesystem archives bounded over time.
//!
//! # Usage
//!
//! ```bash
//! # Run with default settings
//! wattlog-ingest
//!
//! # Run with custom paths and aggressive dedupe
//! wattlog-ingest \
//!     --export-dir /var/lib/wattlog/export/events \
//!     --db /var/lib/wattlog/data/events.sqlite3 \
//!     --dedup-mode decision_only
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) for graceful shutdown:
//! 1. Finishes the file currently being processed
//! 2. Runs a final truncating WAL checkpoint
//! 3. Exits cleanly
//!
//! No event in flight is lost: a file leaves the queue only after its store
//! transaction has committed.

use anyhow::{Context, Result};
use clap::Parser;
use metrics::gauge;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wattlog_core::metrics::{init_metrics, start_metrics_server};
use wattlog_ingest::{
    CheckpointConfig, CheckpointManager, DedupeConfig, Deduplicator, EventStore, ExportQueue,
    FidelityMode, Ingestor, QuantizeSteps, QueueConfig, RetentionConfig, RetentionManager,
    StoreConfig,
};

const DAY_MS: i64 = 24 * 3600 * 1000;

/// Minimum sleep between polls, so an aggressive `--poll-secs` can never
/// busy-spin the loop.
const MIN_POLL: Duration = Duration::from_millis(200);

/// Wattlog ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "wattlog-ingest")]
#[command(about = "Ingest control-loop JSON events into SQLite")]
#[command(version)]
struct Args {
    /// Directory watched for incoming event files
    #[arg(long, default_value = "./export/events")]
    export_dir: PathBuf,

    /// Archive directory for successfully handled files
    #[arg(long, default_value = "./export/processed")]
    processed_dir: PathBuf,

    /// Quarantine directory for malformed files (default: <processed>/bad)
    #[arg(long)]
    quarantine_dir: Option<PathBuf>,

    /// Path to the SQLite event store
    #[arg(long, default_value = "./data/events.sqlite3")]
    db: PathBuf,

    /// Poll interval between drain passes, in seconds
    #[arg(long, default_value = "1.0")]
    poll_secs: f64,

    /// Delete handled files instead of archiving them
    #[arg(long)]
    delete_after_import: bool,

    /// SQLite busy timeout for reader contention, in milliseconds
    #[arg(long, default_value = "5000")]
    busy_timeout_ms: u64,

    /// WAL checkpoint interval, in seconds
    #[arg(long, default_value = "60")]
    checkpoint_secs: u64,

    /// WAL size that escalates the checkpoint to a truncating one
    #[arg(long, default_value = "16777216")] // 16 MB
    wal_max_bytes: u64,

    /// Disable age-based retention (rows are kept forever)
    #[arg(long)]
    no_retention: bool,

    /// Retention pass interval, in seconds
    #[arg(long, default_value = "300")]
    retention_secs: u64,

    /// Age past which rows lose their heavy payload sections, in days
    #[arg(long, default_value = "14")]
    slim_after_days: u32,

    /// Age past which rows are deleted, in days
    #[arg(long, default_value = "90")]
    delete_after_days: u32,

    /// Maximum rows per retention policy per pass
    #[arg(long, default_value = "500")]
    retention_batch: usize,

    /// Disable near-duplicate suppression
    #[arg(long)]
    no_dedup: bool,

    /// Dedupe fidelity: decision_only, decision, or telemetry
    #[arg(long, default_value = "decision")]
    dedup_mode: String,

    /// A heartbeat row is written after this long even without changes,
    /// in seconds
    #[arg(long, default_value = "300")]
    dedup_force_secs: u64,

    /// Quantization step for power values, in watts
    #[arg(long, default_value = "10.0")]
    quant_power_w: f64,

    /// Quantization step for price values, in cents
    #[arg(long, default_value = "1.0")]
    quant_price_cents: f64,

    /// Quantization step for battery state of charge, in percent
    #[arg(long, default_value = "1.0")]
    quant_soc_pct: f64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("wattlog_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Wattlog ingestion daemon starting...");

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
        gauge!("ingest_running").set(1.0);
    }

    // Set up graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    // Initialize pipeline components
    let (mut ingestor, mut checkpoint, mut retention) = init_pipeline(&args)?;

    tracing::info!("Configuration:");
    tracing::info!("  Export dir: {}", args.export_dir.display());
    tracing::info!("  Store: {}", args.db.display());
    tracing::info!(
        "  Dedupe: {}",
        if args.no_dedup {
            "disabled".to_string()
        } else {
            format!(
                "mode={} force={}s",
                args.dedup_mode, args.dedup_force_secs
            )
        }
    );
    tracing::info!(
        "  Retention: {}",
        if args.no_retention {
            "disabled".to_string()
        } else {
            format!(
                "slim>{}d delete>{}d batch={}",
                args.slim_after_days, args.delete_after_days, args.retention_batch
            )
        }
    );

    let poll = Duration::from_secs_f64(args.poll_secs.max(0.0)).max(MIN_POLL);

    // Run totals for the shutdown summary
    let mut total_inserted = 0usize;
    let mut total_deduplicated = 0usize;
    let mut total_quarantined = 0usize;

    tracing::info!("Watching {}", args.export_dir.display());

    while running.load(Ordering::SeqCst) {
        let now_ms = chrono::Utc::now().timestamp_millis();

        // Drain all currently queued files, oldest first
        let stats = ingestor.drain(now_ms);
        total_inserted += stats.inserted;
        total_deduplicated += stats.deduplicated;
        total_quarantined += stats.quarantined;

        if stats.files > 0 {
            tracing::debug!(
                "Drained {} files: {} inserted, {} deduplicated, {} quarantined, {} failed",
                stats.files,
                stats.inserted,
                stats.deduplicated,
                stats.quarantined,
                stats.failed
            );
        }

        // Interval-driven maintenance; failures stay inside the managers
        checkpoint.maybe_run(ingestor.store());
        retention.maybe_run(ingestor.store_mut(), now_ms);

        if let Ok(diag) = ingestor.store().diagnostics() {
            gauge!("store_event_rows").set(diag.event_rows as f64);
            gauge!("store_wal_bytes").set(diag.wal_bytes as f64);
        }

        tokio::time::sleep(poll).await;
    }

    // Shutdown sequence
    tracing::info!("Shutting down...");

    // Final truncating checkpoint so the main file is self-consistent even
    // if the process never restarts
    checkpoint.run_full(ingestor.store());
    gauge!("ingest_running").set(0.0);

    let rows = ingestor.store().count().unwrap_or(-1);

    // Print summary
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events inserted:      {}", total_inserted);
    tracing::info!("Events deduplicated:  {}", total_deduplicated);
    tracing::info!("Events quarantined:   {}", total_quarantined);
    tracing::info!("Rows in store:        {}", rows);

    Ok(())
}

/// Pipeline components: (ingestor, checkpoint manager, retention manager).
type PipelineComponents = (Ingestor, CheckpointManager, RetentionManager);

/// Initialize pipeline components from the parsed arguments.
fn init_pipeline(args: &Args) -> Result<PipelineComponents> {
    let queue = ExportQueue::new(QueueConfig {
        export_dir: args.export_dir.clone(),
        quarantine_dir: args
            .quarantine_dir
            .clone()
            .unwrap_or_else(|| args.processed_dir.join("bad")),
        processed_dir: args.processed_dir.clone(),
        delete_after_import: args.delete_after_import,
    })
    .with_context(|| format!("Failed to prepare export dir {:?}", args.export_dir))?;

    let store = EventStore::open(StoreConfig {
        db_path: args.db.clone(),
        busy_timeout_ms: args.busy_timeout_ms,
    })
    .with_context(|| format!("Failed to open event store at {:?}", args.db))?;

    let rows = store.count()?;
    tracing::info!("Event store opened: {} rows", rows);

    let mode = FidelityMode::from_str(&args.dedup_mode)
        .map_err(|_| anyhow::anyhow!("Invalid --dedup-mode '{}'", args.dedup_mode))?;

    let dedupe = Deduplicator::new(DedupeConfig {
        enabled: !args.no_dedup,
        mode,
        force_interval_ms: (args.dedup_force_secs as i64) * 1000,
        steps: QuantizeSteps {
            power_w: args.quant_power_w,
            price_cents: args.quant_price_cents,
            soc_pct: args.quant_soc_pct,
        },
    });

    let mut ingestor = Ingestor::new(queue, dedupe, store);
    ingestor
        .rehydrate()
        .context("Failed to rehydrate dedupe state from the store")?;

    let checkpoint = CheckpointManager::new(CheckpointConfig {
        interval: Duration::from_secs(args.checkpoint_secs),
        wal_max_bytes: args.wal_max_bytes,
    });

    let retention = RetentionManager::new(RetentionConfig {
        enabled: !args.no_retention,
        interval: Duration::from_secs(args.retention_secs),
        slim_after_ms: i64::from(args.slim_after_days) * DAY_MS,
        delete_after_ms: i64::from(args.delete_after_days) * DAY_MS,
        batch: args.retention_batch,
    });

    Ok((ingestor, checkpoint, retention))
}
