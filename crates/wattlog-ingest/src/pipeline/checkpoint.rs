//! WAL checkpoint scheduling.
//!
//! The write-ahead log grows without bound unless it is periodically folded
//! back into the main store file. The [`CheckpointManager`] runs on a fixed
//! interval independent of ingestion volume: a cheap PASSIVE fold by
//! default, escalating to a blocking TRUNCATE fold once the log has grown
//! past the configured size threshold. A final TRUNCATE fold runs at
//! graceful shutdown so the main file is self-consistent even if the
//! process never restarts.
//!
//! A folding failure is never fatal: it is logged, counted, and retried on
//! the next interval.

use crate::pipeline::store::{CheckpointMode, EventStore};
use metrics::counter;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for the checkpoint manager.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// How often to attempt a checkpoint.
    /// Default: 60 s
    pub interval: Duration,

    /// WAL size above which the passive fold escalates to a truncating one.
    /// Default: 16 MB
    pub wal_max_bytes: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            wal_max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Interval-driven WAL folding.
pub struct CheckpointManager {
    config: CheckpointConfig,
    last_run: Instant,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        Self {
            config,
            last_run: Instant::now(),
        }
    }

    /// Run a checkpoint if the interval has elapsed. Errors never escape.
    pub fn maybe_run(&mut self, store: &EventStore) {
        if self.last_run.elapsed() < self.config.interval {
            return;
        }
        self.last_run = Instant::now();

        let mode = self.select_mode(store.wal_size_bytes());
        self.run(store, mode);
    }

    /// Run the final, unconditionally truncating checkpoint at shutdown.
    pub fn run_full(&self, store: &EventStore) {
        self.run(store, CheckpointMode::Truncate);
    }

    /// PASSIVE until the WAL outgrows the threshold, then TRUNCATE.
    fn select_mode(&self, wal_bytes: u64) -> CheckpointMode {
        if wal_bytes > self.config.wal_max_bytes {
            CheckpointMode::Truncate
        } else {
            CheckpointMode::Passive
        }
    }

    fn run(&self, store: &EventStore, mode: CheckpointMode) {
        match store.checkpoint(mode) {
            Ok(result) => {
                counter!("checkpoint_runs_total").increment(1);
                debug!(
                    "Checkpoint ({}) folded {}/{} frames{}",
                    mode.as_str(),
                    result.checkpointed_frames,
                    result.log_frames,
                    if result.busy == 1 { " (busy)" } else { "" }
                );
            }
            Err(e) => {
                counter!("checkpoint_failures_total").increment(1);
                warn!("Checkpoint ({}) failed: {}", mode.as_str(), e);
            }
        }
    }
}
