//! Two-tier age-based retention.
//!
//! Storage stays bounded under continuous write pressure through two
//! independent policies, both batch-bounded so no run holds a long
//! transaction:
//!
//! - **Slimming**: rows older than the full-fidelity age have the heavy
//!   payload sections stripped from `data_json`; the row and its extracted
//!   columns remain queryable indefinitely.
//! - **Deletion**: rows older than the (longer) deletion age are removed
//!   permanently, along with any annotations referencing them.
//!
//! Retention failures are logged and skipped, never propagated to the
//! ingestion loop.

use crate::error::Result;
use crate::pipeline::store::EventStore;
use metrics::counter;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Configuration for the retention manager.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Master switch; disabled means rows are kept forever.
    pub enabled: bool,

    /// How often a retention pass runs.
    /// Default: 300 s
    pub interval: Duration,

    /// Age past which rows are slimmed.
    /// Default: 14 days
    pub slim_after_ms: i64,

    /// Age past which rows are deleted. Expected to exceed `slim_after_ms`.
    /// Default: 90 days
    pub delete_after_ms: i64,

    /// Maximum rows processed per policy per run.
    /// Default: 500
    pub batch: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300),
            slim_after_ms: 14 * 24 * 3600 * 1000,
            delete_after_ms: 90 * 24 * 3600 * 1000,
            batch: 500,
        }
    }
}

/// Rows touched by one retention pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetentionStats {
    pub slimmed: usize,
    pub deleted: usize,
}

/// Interval-driven slimming and deletion of aged rows.
pub struct RetentionManager {
    config: RetentionConfig,
    last_run: Instant,
}

impl RetentionManager {
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            config,
            last_run: Instant::now(),
        }
    }

    /// Run a retention pass if enabled and the interval has elapsed.
    /// Errors never escape.
    pub fn maybe_run(&mut self, store: &mut EventStore, now_ms: i64) {
        if !self.config.enabled || self.last_run.elapsed() < self.config.interval {
            return;
        }
        self.last_run = Instant::now();

        match self.run(store, now_ms) {
            Ok(stats) => {
                if stats.slimmed > 0 || stats.deleted > 0 {
                    counter!("retention_slimmed_total").increment(stats.slimmed as u64);
                    counter!("retention_deleted_total").increment(stats.deleted as u64);
                    info!(
                        "Retention pass: {} slimmed, {} deleted",
                        stats.slimmed, stats.deleted
                    );
                }
            }
            Err(e) => {
                counter!("retention_failures_total").increment(1);
                warn!("Retention pass failed: {}", e);
            }
        }
    }

    /// One batch-bounded slim + delete pass against `now_ms`.
    pub fn run(&self, store: &mut EventStore, now_ms: i64) -> Result<RetentionStats> {
        let slim_cutoff = now_ms.saturating_sub(self.config.slim_after_ms);
        let delete_cutoff = now_ms.saturating_sub(self.config.delete_after_ms);

        let slimmed = store.slim_batch(slim_cutoff, self.config.batch)?;
        let deleted = store.delete_batch(delete_cutoff, self.config.batch)?;

        Ok(RetentionStats { slimmed, deleted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wattlog_core::DecodedEvent;

    const DAY_MS: i64 = 24 * 3600 * 1000;

    fn insert(store: &EventStore, event_id: &str, ts_epoch_ms: i64) {
        let raw = json!({
            "event_id": event_id,
            "ts_epoch_ms": ts_epoch_ms,
            "decision": { "want_pct": 30 },
            "sources": { "et": { "pv_est_w": 3120 } }
        })
        .to_string();
        let event = DecodedEvent::decode(raw.as_bytes(), 0).unwrap();
        store.insert_event(&event).unwrap();
    }

    #[test]
    fn test_two_tier_policy() {
        let mut store = EventStore::open_in_memory().unwrap();
        let now = 100 * DAY_MS;

        insert(&store, "ev-ancient", now - 91 * DAY_MS); // past deletion age
        insert(&store, "ev-aged", now - 30 * DAY_MS); // past slim age only
        insert(&store, "ev-fresh", now - DAY_MS); // untouched
        store.upsert_note("ev-ancient", "gone with the row").unwrap();

        let mgr = RetentionManager::new(RetentionConfig::default());
        let stats = mgr.run(&mut store, now).unwrap();

        // The ancient row was slimmed and then deleted in the same pass;
        // both counts reflect work actually performed.
        assert_eq!(stats.slimmed, 2);
        assert_eq!(stats.deleted, 1);

        assert!(store.get_by_event_id("ev-ancient").unwrap().is_none());
        assert!(store.get_note("ev-ancient").unwrap().is_none());

        let aged = store.get_by_event_id("ev-aged").unwrap().unwrap();
        assert!(aged.slimmed);
        assert_eq!(aged.want_pct, Some(30));
        let payload: serde_json::Value = serde_json::from_str(&aged.data_json).unwrap();
        assert!(payload.get("sources").is_none());

        let fresh = store.get_by_event_id("ev-fresh").unwrap().unwrap();
        assert!(!fresh.slimmed);
    }

    #[test]
    fn test_batch_bound_applies_per_policy() {
        let mut store = EventStore::open_in_memory().unwrap();
        let now = 100 * DAY_MS;
        for i in 0..5 {
            insert(&store, &format!("ev-{i}"), now - (91 + i) * DAY_MS);
        }

        let mgr = RetentionManager::new(RetentionConfig {
            batch: 2,
            ..Default::default()
        });

        let stats = mgr.run(&mut store, now).unwrap();
        assert_eq!(stats.slimmed, 2);
        assert_eq!(stats.deleted, 2);
        assert_eq!(store.count().unwrap(), 3);

        // The remainder drains on subsequent runs.
        mgr.run(&mut store, now).unwrap();
        mgr.run(&mut store, now).unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_disabled_retention_never_runs() {
        let mut store = EventStore::open_in_memory().unwrap();
        insert(&store, "ev-ancient", 0);

        let mut mgr = RetentionManager::new(RetentionConfig {
            enabled: false,
            interval: Duration::ZERO,
            ..Default::default()
        });
        mgr.maybe_run(&mut store, 1000 * DAY_MS);

        assert_eq!(store.count().unwrap(), 1);
        assert!(!store.latest().unwrap().unwrap().slimmed);
    }
}
