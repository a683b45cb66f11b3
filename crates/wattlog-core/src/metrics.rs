//! Prometheus metrics helpers for the Wattlog system.
//!
//! This module provides centralized metrics initialization and common metric
//! definitions used across Wattlog components.
//!
//! # Usage
//!
//! ```rust,ignore
//! use wattlog_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Initialize the Prometheus recorder
//!     let handle = init_metrics();
//!
//!     // Start the HTTP server for /metrics endpoint
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     // Now use metrics anywhere in your code
//!     use metrics::{counter, gauge};
//!     counter!("my_counter").increment(1);
//!     gauge!("my_gauge").set(42.0);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! All Wattlog metrics follow these conventions:
//! - Prefix: Component name (e.g., `ingest_`, `retention_`, `checkpoint_`)
//! - Suffix: Unit or type (e.g., `_total`, `_bytes`, `_seconds`)
//! - Labels: Use sparingly to avoid cardinality explosion

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// This must be called once at startup before any metrics are recorded.
/// Returns a handle that can be used with [`start_metrics_server`].
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    // Register all metric descriptions upfront
    register_common_metrics();

    handle
}

/// Try to initialize the Prometheus metrics recorder.
///
/// Like [`init_metrics`] but returns `None` if the recorder is already
/// installed, instead of panicking. Useful for tests or optional metrics.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the Prometheus metrics HTTP server.
///
/// Serves the `/metrics` endpoint on the specified port.
/// This spawns a background task and returns immediately.
///
/// # Arguments
///
/// * `port` - TCP port to listen on (e.g., 9090)
/// * `handle` - Prometheus handle from [`init_metrics`]
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Spawn the server in the background
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::warn!("Metrics server exited: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for common metrics used across Wattlog.
///
/// Called automatically by [`init_metrics`].
fn register_common_metrics() {
    // =========================================================================
    // Ingestion Metrics
    // =========================================================================

    describe_counter!(
        "ingest_events_inserted_total",
        "Events decoded and committed to the store"
    );
    describe_counter!(
        "ingest_events_deduplicated_total",
        "Events skipped as near-duplicates of the last inserted row"
    );
    describe_counter!(
        "ingest_events_quarantined_total",
        "Malformed event files moved to the quarantine area"
    );
    describe_counter!(
        "ingest_files_total",
        "Total event files pulled from the export directory"
    );
    describe_gauge!(
        "ingest_running",
        "Whether the ingestion daemon is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Store Maintenance Metrics
    // =========================================================================

    describe_counter!(
        "checkpoint_runs_total",
        "WAL checkpoint attempts (passive or truncating)"
    );
    describe_counter!("checkpoint_failures_total", "WAL checkpoint failures");
    describe_gauge!("store_wal_bytes", "Size of the write-ahead log sidecar file");
    describe_gauge!("store_event_rows", "Number of rows in the events table");

    // =========================================================================
    // Retention Metrics
    // =========================================================================

    describe_counter!(
        "retention_slimmed_total",
        "Aged rows stripped of heavy payload sections"
    );
    describe_counter!(
        "retention_deleted_total",
        "Rows deleted by the age-based retention policy"
    );
    describe_counter!("retention_failures_total", "Retention pass failures");
}
