//! Core types, validation, and shared utilities for the Wattlog ingestion
//! pipeline.
//!
//! This crate provides:
//! - Decoding and validation of control-loop JSON events
//! - Defensive extraction of the denormalized decision columns
//! - Canonical payload serialization for storage
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
mod event;
pub mod metrics;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Payload sections stripped by retention slimming.
///
/// These carry the per-sample telemetry bulk; the `decision`, `write`, and
/// `battery` summaries survive slimming alongside the extracted columns.
pub const HEAVY_PAYLOAD_KEYS: &[&str] = &["sources", "meter", "wifi", "price"];

pub use error::{Error, Result};
pub use event::{DecisionColumns, DecodedEvent};
