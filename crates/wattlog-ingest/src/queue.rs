//! Export-directory work queue.
//!
//! The producer control loop writes one JSON event per file into the export
//! directory, always via write-then-rename, so a listed file is never
//! partially written. This module lists those files in deterministic order
//! and removes each from the queue exactly once handled: moved to the
//! processed area, deleted, moved to quarantine, or — when every move
//! fails — excluded from future listings by an in-place rename marker.
//!
//! Disposal never loses data: the store commit happens before disposal is
//! attempted, and insert-or-ignore on the natural key makes a reprocessed
//! file harmless.

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Configuration for the export queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory watched for incoming event files.
    pub export_dir: PathBuf,

    /// Terminal area for successfully handled files.
    pub processed_dir: PathBuf,

    /// Terminal area for malformed files, excluded from reprocessing.
    pub quarantine_dir: PathBuf,

    /// Delete handled files instead of archiving them.
    pub delete_after_import: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let processed_dir = PathBuf::from("./export/processed");
        Self {
            export_dir: PathBuf::from("./export/events"),
            quarantine_dir: processed_dir.join("bad"),
            processed_dir,
            delete_after_import: false,
        }
    }
}

/// Filesystem-backed work queue over the export directory.
pub struct ExportQueue {
    config: QueueConfig,
}

impl ExportQueue {
    /// Create the queue, ensuring the export directory exists.
    pub fn new(config: QueueConfig) -> Result<Self> {
        fs::create_dir_all(&config.export_dir)?;
        Ok(Self { config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// List eligible `*.json` files, sorted lexicographically by name.
    ///
    /// Time-stamped file names therefore process oldest-first. Marker
    /// renames (`.done`, `.bad`) change the extension, so marked files
    /// drop out of this listing.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(&self.config.export_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
            .collect();

        // Sort for deterministic processing order
        files.sort();
        Ok(files)
    }

    /// Remove a successfully handled file from the queue.
    ///
    /// Deletes when configured, else archives into the processed area. The
    /// insert is already durably committed, so every failure here degrades
    /// to the next-safest disposal instead of propagating.
    pub fn dispose_handled(&self, path: &Path) {
        if self.config.delete_after_import {
            if let Err(e) = fs::remove_file(path) {
                warn!("Failed to delete {}: {}", path.display(), e);
            }
            return;
        }

        match move_into(&self.config.processed_dir, path) {
            Ok(dst) => debug!("Archived {} -> {}", path.display(), dst.display()),
            Err(e) => {
                warn!(
                    "Failed to archive {}: {}; falling back to rename marker",
                    path.display(),
                    e
                );
                mark_in_place(path, "done");
            }
        }
    }

    /// Remove a malformed file from the queue so it is never retried.
    ///
    /// Quarantine failures are themselves tolerated: the fallback is an
    /// in-place `.bad` marker, and if even that fails the file stays put
    /// and is retried on a later pass.
    pub fn dispose_quarantined(&self, path: &Path) {
        match move_into(&self.config.quarantine_dir, path) {
            Ok(dst) => debug!("Quarantined {} -> {}", path.display(), dst.display()),
            Err(e) => {
                warn!(
                    "Failed to quarantine {}: {}; falling back to rename marker",
                    path.display(),
                    e
                );
                mark_in_place(path, "bad");
            }
        }
    }
}

/// Move `path` into `dir`, disambiguating name collisions with a
/// time-based `.dup` suffix rather than overwriting.
fn move_into(dir: &Path, path: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other("path has no file name"))?;
    let mut dst = dir.join(name);

    if dst.exists() {
        let epoch_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let stem = path.file_stem().unwrap_or(name).to_string_lossy();
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        dst = dir.join(format!("{stem}.dup{epoch_secs}{ext}"));
    }

    fs::rename(path, &dst)?;
    Ok(dst)
}

/// Append a marker extension in place (`x.json` -> `x.json.done`) so the
/// file drops out of future listings without being moved.
fn mark_in_place(path: &Path, marker: &str) {
    let mut dst = path.as_os_str().to_owned();
    dst.push(format!(".{marker}"));
    if let Err(e) = fs::rename(path, PathBuf::from(&dst)) {
        // Nothing left to try; the file stays visible and is retried.
        warn!("Failed to mark {} as .{}: {}", path.display(), marker, e);
    }
}
