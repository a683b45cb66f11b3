//! Wattlog ingestion pipeline components.
//!
//! This crate provides the daemon that turns the control loop's exported
//! JSON event files into a bounded, queryable SQLite archive.
//!
//! # Modules
//!
//! - [`queue`] - Export-directory work queue (listing, disposal, quarantine)
//! - [`pipeline`] - Dedupe signature engine, event store, checkpoint and
//!   retention managers
//! - [`ingestor`] - Per-file pipeline tying queue, dedupe, and store together
//! - [`prune`] - Archive pruning for the companion `archive-prune` binary
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Export dir     │  (one JSON event per file, written via rename)
//! └────────┬────────┘
//!          │  sorted-name order
//!          ▼
//! ┌─────────────────┐
//! │  Event Decoder  │  wattlog-core - validates, extracts columns
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   Deduplicator  │  quantized signature vs. last inserted row
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   EventStore    │  SQLite (WAL) - idempotent on event_id
//! └─────────────────┘
//!     ↑          ↑
//! checkpoint  retention   (interval-driven, failure-isolated)
//! ```
//!
//! The pipeline is store-first: a file is disposed of only after its store
//! transaction commits, and dedupe state is rehydrated from the store on
//! restart, so a crash at any point is at worst a reprocessed file folding
//! into a no-op insert.

pub mod error;
pub mod ingestor;
pub mod pipeline;
pub mod prune;
pub mod queue;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use ingestor::{DrainStats, FileOutcome, Ingestor};
pub use pipeline::{
    CheckpointConfig, CheckpointManager, CheckpointMode, DedupeConfig, DedupeDecision,
    Deduplicator, EventStore, FidelityMode, QuantizeSteps, RetentionConfig, RetentionManager,
    StoreConfig, StoredEvent,
};
pub use queue::{ExportQueue, QueueConfig};
