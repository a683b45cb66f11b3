//! Pruning of the processed/quarantine archives.
//!
//! The store has its own retention; the filesystem archives grow
//! independently and are pruned by file modification age. This runs from
//! the `archive-prune` companion binary, not the ingestion loop.

use crate::error::Result;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Counters from one pruning pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneStats {
    pub examined: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl PruneStats {
    fn merge(&mut self, other: PruneStats) {
        self.examined += other.examined;
        self.deleted += other.deleted;
        self.failed += other.failed;
    }
}

/// Delete files under `dir` (recursively) whose modification time is older
/// than `max_age`. Directories themselves are left in place.
///
/// With `dry_run`, counts what would be deleted without touching anything.
/// Per-file errors are tolerated and counted.
pub fn prune_dir(dir: &Path, max_age: Duration, dry_run: bool) -> Result<PruneStats> {
    if !dir.is_dir() {
        return Ok(PruneStats::default());
    }

    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_below(dir, cutoff, dry_run)
}

fn prune_below(dir: &Path, cutoff: SystemTime, dry_run: bool) -> Result<PruneStats> {
    let mut stats = PruneStats::default();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Unreadable entry under {}: {}", dir.display(), e);
                stats.failed += 1;
                continue;
            }
        };
        let path = entry.path();

        if path.is_dir() {
            match prune_below(&path, cutoff, dry_run) {
                Ok(sub) => stats.merge(sub),
                Err(e) => {
                    warn!("Failed to prune {}: {}", path.display(), e);
                    stats.failed += 1;
                }
            }
            continue;
        }

        stats.examined += 1;

        let modified = entry.metadata().and_then(|m| m.modified());
        let expired = match modified {
            Ok(mtime) => mtime <= cutoff,
            Err(e) => {
                warn!("No mtime for {}: {}", path.display(), e);
                stats.failed += 1;
                continue;
            }
        };

        if !expired {
            continue;
        }

        if dry_run {
            debug!("Would delete {}", path.display());
            stats.deleted += 1;
        } else {
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    stats.deleted += 1;
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    stats.failed += 1;
                }
            }
        }
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prune_missing_dir_is_a_noop() {
        let stats = prune_dir(
            Path::new("/definitely/not/here"),
            Duration::from_secs(0),
            false,
        )
        .unwrap();
        assert_eq!(stats.examined, 0);
    }

    #[test]
    fn test_young_files_survive() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("recent.json"), b"{}").unwrap();

        let stats = prune_dir(tmp.path(), Duration::from_secs(3600), false).unwrap();
        assert_eq!(stats.examined, 1);
        assert_eq!(stats.deleted, 0);
        assert!(tmp.path().join("recent.json").exists());
    }

    #[test]
    fn test_expired_files_are_deleted_recursively() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("old.json"), b"{}").unwrap();
        fs::create_dir(tmp.path().join("bad")).unwrap();
        fs::write(tmp.path().join("bad").join("older.json"), b"{}").unwrap();

        // A zero max-age expires everything already on disk
        let stats = prune_dir(tmp.path(), Duration::ZERO, false).unwrap();
        assert_eq!(stats.examined, 2);
        assert_eq!(stats.deleted, 2);
        assert!(!tmp.path().join("old.json").exists());
        assert!(!tmp.path().join("bad").join("older.json").exists());
        // Directories stay
        assert!(tmp.path().join("bad").is_dir());
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("old.json"), b"{}").unwrap();

        let stats = prune_dir(tmp.path(), Duration::ZERO, true).unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(tmp.path().join("old.json").exists());
    }
}
