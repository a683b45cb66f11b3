//! Archive pruning utility.
//!
//! This tool deletes aged files from the processed and quarantine archives
//! by modification time. It runs as a companion process (cron or timer),
//! independent of the ingestion daemon and the store's own retention.
//!
//! # Usage
//!
//! ```bash
//! # Dry run (show what would be deleted, don't modify)
//! archive-prune --processed-dir ./export/processed --dry-run
//!
//! # Actually prune files older than a week
//! archive-prune --processed-dir ./export/processed --max-age-days 7
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use wattlog_ingest::prune::{PruneStats, prune_dir};

/// Archive pruning utility.
#[derive(Parser, Debug)]
#[command(name = "archive-prune")]
#[command(about = "Prune aged files from the processed/quarantine archives")]
#[command(version)]
struct Args {
    /// Processed-files archive directory
    #[arg(long, default_value = "./export/processed")]
    processed_dir: PathBuf,

    /// Quarantine directory (pruned too; may be nested in the processed dir)
    #[arg(long)]
    quarantine_dir: Option<PathBuf>,

    /// Delete files whose modification time is older than this many days
    #[arg(long, default_value = "14")]
    max_age_days: u32,

    /// Dry run - show what would be deleted without making changes
    #[arg(long)]
    dry_run: bool,

    /// Verbose output - show each file being deleted
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(default_level.parse().unwrap()),
        )
        .init();

    let max_age = Duration::from_secs(u64::from(args.max_age_days) * 24 * 3600);
    let quarantine_dir = args
        .quarantine_dir
        .unwrap_or_else(|| args.processed_dir.join("bad"));

    let mut totals = PruneStats::default();
    for dir in [&args.processed_dir, &quarantine_dir] {
        // The quarantine area usually nests inside the processed area, in
        // which case the first pass already covered it and this one no-ops.
        let stats = prune_dir(dir, max_age, args.dry_run)?;
        tracing::info!(
            "{}: {} examined, {} {}, {} failed",
            dir.display(),
            stats.examined,
            stats.deleted,
            if args.dry_run { "would delete" } else { "deleted" },
            stats.failed
        );
        totals.examined += stats.examined;
        totals.deleted += stats.deleted;
        totals.failed += stats.failed;
    }

    tracing::info!(
        "Done: {} files examined, {} {} (older than {} days)",
        totals.examined,
        totals.deleted,
        if args.dry_run { "would be deleted" } else { "deleted" },
        args.max_age_days
    );

    Ok(())
}
