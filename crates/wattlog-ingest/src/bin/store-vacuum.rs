//! Offline store compaction utility.
//!
//! Runs a full truncating WAL checkpoint followed by `VACUUM` to reclaim
//! freed space at the file level. VACUUM rewrites the whole store file and
//! must run outside any open transaction, so it lives in this standalone
//! tool rather than the daemon's hot loop. Stop the daemon (or accept a
//! busy-timeout wait) before running it.
//!
//! # Usage
//!
//! ```bash
//! store-vacuum --db ./data/events.sqlite3
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use wattlog_ingest::{CheckpointMode, EventStore, StoreConfig};

/// Offline store compaction utility.
#[derive(Parser, Debug)]
#[command(name = "store-vacuum")]
#[command(about = "Checkpoint and VACUUM the event store to reclaim disk space")]
#[command(version)]
struct Args {
    /// Path to the SQLite event store
    #[arg(long, default_value = "./data/events.sqlite3")]
    db: PathBuf,

    /// SQLite busy timeout while contending with a running daemon, in
    /// milliseconds
    #[arg(long, default_value = "30000")]
    busy_timeout_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();

    let store = EventStore::open(StoreConfig {
        db_path: args.db.clone(),
        busy_timeout_ms: args.busy_timeout_ms,
    })
    .with_context(|| format!("Failed to open event store at {:?}", args.db))?;

    let before = store.db_size_bytes() + store.wal_size_bytes();
    tracing::info!(
        "Store {}: {} rows, {} bytes (incl. WAL)",
        args.db.display(),
        store.count()?,
        before
    );

    let result = store
        .checkpoint(CheckpointMode::Truncate)
        .context("WAL checkpoint failed")?;
    tracing::info!(
        "Checkpoint folded {}/{} frames",
        result.checkpointed_frames,
        result.log_frames
    );

    store.vacuum().context("VACUUM failed")?;

    let after = store.db_size_bytes() + store.wal_size_bytes();
    tracing::info!(
        "VACUUM complete: {} -> {} bytes ({} reclaimed)",
        before,
        after,
        before.saturating_sub(after)
    );

    Ok(())
}
