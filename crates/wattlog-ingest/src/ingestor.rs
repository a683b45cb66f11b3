//! Per-file ingestion pipeline.
//!
//! The [`Ingestor`] owns the queue, the deduplicator, and the store, and
//! runs one event file through the whole chain: read → decode →
//! dedupe-decide → commit → dispose. Failures are isolated at the file
//! scope — one bad file never halts a drain pass, and a store error leaves
//! the file in place for the next poll.

use crate::pipeline::{DedupeDecision, Deduplicator, EventStore};
use crate::queue::ExportQueue;
use metrics::counter;
use std::path::Path;
use tracing::{debug, warn};
use wattlog_core::DecodedEvent;

/// Terminal disposition of one event file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Decoded and committed (or redelivered with an already-stored key).
    Inserted,
    /// Informationally identical to the last inserted event; disposed of
    /// as handled without a new row.
    DuplicateSkipped,
    /// Malformed; moved to quarantine, never retried.
    Quarantined,
    /// Transient failure (I/O, store); left in place for the next poll.
    Failed,
}

/// Counters from one drain pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainStats {
    pub files: usize,
    pub inserted: usize,
    pub deduplicated: usize,
    pub quarantined: usize,
    pub failed: usize,
}

/// The ingestion pipeline: queue → decode → dedupe → store → dispose.
pub struct Ingestor {
    queue: ExportQueue,
    dedupe: Deduplicator,
    store: EventStore,
}

impl Ingestor {
    pub fn new(queue: ExportQueue, dedupe: Deduplicator, store: EventStore) -> Self {
        Self {
            queue,
            dedupe,
            store,
        }
    }

    /// Re-derive dedupe state from the newest stored row (startup only).
    pub fn rehydrate(&mut self) -> crate::error::Result<()> {
        self.dedupe.rehydrate(&self.store)
    }

    /// The underlying store, for diagnostics.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Mutable store access, for the maintenance managers.
    pub fn store_mut(&mut self) -> &mut EventStore {
        &mut self.store
    }

    /// Process every currently queued file once, in sorted-name order.
    ///
    /// `now_ms` is the ingestion wall clock, substituted into events the
    /// producer left without a timestamp.
    pub fn drain(&mut self, now_ms: i64) -> DrainStats {
        let files = match self.queue.list() {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to list export directory: {}", e);
                return DrainStats::default();
            }
        };

        let mut stats = DrainStats::default();
        for path in files {
            stats.files += 1;
            counter!("ingest_files_total").increment(1);

            match self.process_file(&path, now_ms) {
                FileOutcome::Inserted => {
                    stats.inserted += 1;
                    counter!("ingest_events_inserted_total").increment(1);
                }
                FileOutcome::DuplicateSkipped => {
                    stats.deduplicated += 1;
                    counter!("ingest_events_deduplicated_total").increment(1);
                }
                FileOutcome::Quarantined => {
                    stats.quarantined += 1;
                    counter!("ingest_events_quarantined_total").increment(1);
                }
                FileOutcome::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Run a single file through the pipeline.
    pub fn process_file(&mut self, path: &Path, now_ms: i64) -> FileOutcome {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to read {}: {}", path.display(), e);
                return FileOutcome::Failed;
            }
        };

        let event = match DecodedEvent::decode(&raw, now_ms) {
            Ok(event) => event,
            Err(e) if e.is_malformed_input() => {
                warn!("Rejecting {}: {}", path.display(), e);
                self.queue.dispose_quarantined(path);
                return FileOutcome::Quarantined;
            }
            Err(e) => {
                warn!("Failed to decode {}: {}", path.display(), e);
                return FileOutcome::Failed;
            }
        };

        // Elapsed time for the force interval runs on the event timeline,
        // matching what rehydration reconstructs after a restart.
        match self.dedupe.check(&event.payload, event.ts_epoch_ms) {
            DedupeDecision::Skip => {
                debug!("Skipping near-duplicate {}", event.event_id);
                self.queue.dispose_handled(path);
                FileOutcome::DuplicateSkipped
            }
            DedupeDecision::Insert { signature } => {
                match self.store.insert_event(&event) {
                    Ok(created) => {
                        if created {
                            self.dedupe.record_insert(signature, event.ts_epoch_ms);
                        } else {
                            debug!("Redelivered known event {}", event.event_id);
                        }
                        // Disposal only after the commit; a crash between the
                        // two just reprocesses the file into a no-op insert.
                        self.queue.dispose_handled(path);
                        FileOutcome::Inserted
                    }
                    Err(e) => {
                        warn!(
                            "Store error for {}, leaving file for retry: {}",
                            path.display(),
                            e
                        );
                        FileOutcome::Failed
                    }
                }
            }
        }
    }
}
