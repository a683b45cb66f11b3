//! Durable event store backed by SQLite.
//!
//! Single writer, many readers: the daemon holds the one writer connection
//! for its whole lifetime, while external consumers (the dashboard) attach
//! their own read-only connections. WAL journaling keeps the two sides from
//! blocking each other; a busy timeout absorbs transient lock contention.
//!
//! Every mutating operation is a short, immediately-committed transaction —
//! the store never holds a transaction open across loop iterations.

use crate::error::Result;
use crate::pipeline::schema;
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::PathBuf;
use wattlog_core::{DecodedEvent, HEAVY_PAYLOAD_KEYS};

/// Configuration for the event store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,

    /// Busy timeout for transient lock contention from concurrent readers.
    /// Default: 5000 ms
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/events.sqlite3"),
            busy_timeout_ms: 5000,
        }
    }
}

/// One stored event row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    /// Internal insertion order (AUTOINCREMENT primary key).
    pub id: i64,
    pub event_id: String,
    pub ts_utc: Option<String>,
    pub ts_local: Option<String>,
    pub ts_epoch_ms: Option<i64>,
    pub host: Option<String>,
    pub pid: Option<i64>,
    #[serde(rename = "loop")]
    pub loop_no: Option<i64>,
    pub export_costs: Option<i64>,
    pub want_pct: Option<i64>,
    pub want_enabled: Option<i64>,
    pub reason: Option<String>,
    /// True once retention has stripped the heavy payload sections.
    pub slimmed: bool,
    pub data_json: String,
}

/// One user annotation row.
#[derive(Debug, Clone, Serialize)]
pub struct EventNote {
    pub event_id: String,
    pub note: Option<String>,
    pub updated_ts_utc: Option<String>,
}

/// WAL checkpoint aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Fold what can be folded without blocking any reader.
    Passive,
    /// Block until the whole log is folded, then truncate it.
    Truncate,
}

impl CheckpointMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Truncate => "TRUNCATE",
        }
    }
}

/// Result of a WAL checkpoint, as reported by SQLite.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointResult {
    /// 1 if the checkpoint could not complete due to a concurrent reader.
    pub busy: i64,
    /// Total frames in the log.
    pub log_frames: i64,
    /// Frames successfully folded back into the main file.
    pub checkpointed_frames: i64,
}

/// Store-level diagnostics for logs and metrics.
#[derive(Debug, Clone, Copy)]
pub struct StoreDiagnostics {
    pub event_rows: i64,
    pub db_bytes: u64,
    pub wal_bytes: u64,
}

const EVENT_COLUMNS: &str = "id, event_id, ts_utc, ts_local, ts_epoch_ms, host, pid, loop, \
     export_costs, want_pct, want_enabled, reason, slimmed, data_json";

/// SQLite-backed event store.
pub struct EventStore {
    conn: Connection,
    db_path: PathBuf,
}

impl EventStore {
    /// Open or create the store at the configured path.
    ///
    /// Applies the WAL/busy-timeout pragmas and runs the idempotent schema
    /// initialization (including additive column migrations).
    pub fn open(config: StoreConfig) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&config.db_path)?;

        // Enable WAL mode for non-blocking concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;

        schema::init_schema(&conn)?;

        Ok(Self {
            conn,
            db_path: config.db_path,
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;

        Ok(Self {
            conn,
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Insert an event, ignoring duplicates of the natural key.
    ///
    /// Returns `true` if a row was created, `false` if `event_id` was
    /// already present (a successful no-op — the first-seen payload wins).
    pub fn insert_event(&self, event: &DecodedEvent) -> Result<bool> {
        let payload = event.payload_json()?;

        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO events (
                event_id, ts_utc, ts_local, ts_epoch_ms, host, pid, loop,
                export_costs, want_pct, want_enabled, reason, data_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                event.event_id,
                event.ts_utc,
                event.ts_local,
                event.ts_epoch_ms,
                event.host,
                event.pid,
                event.loop_no,
                event.decision.export_costs.map(i64::from),
                event.decision.want_pct,
                event.decision.want_enabled,
                event.decision.reason,
                payload,
            ],
        )?;

        Ok(changed == 1)
    }

    /// The most recently inserted event (by internal insertion order).
    pub fn latest(&self) -> Result<Option<StoredEvent>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id DESC LIMIT 1"),
                [],
                row_to_event,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch a single event by internal id.
    pub fn get(&self, id: i64) -> Result<Option<StoredEvent>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                row_to_event,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch a single event by its natural key.
    pub fn get_by_event_id(&self, event_id: &str) -> Result<Option<StoredEvent>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
                params![event_id],
                row_to_event,
            )
            .optional()?;
        Ok(row)
    }

    /// Events with internal id greater than `after_id`, oldest first.
    pub fn range_after(&self, after_id: i64, limit: usize) -> Result<Vec<StoredEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE id > ?1 ORDER BY id ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![after_id, limit as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of event rows.
    pub fn count(&self) -> Result<i64> {
        let n = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n)
    }

    /// Create or replace the annotation for an event.
    pub fn upsert_note(&self, event_id: &str, note: &str) -> Result<()> {
        let updated = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.conn.execute(
            "INSERT INTO event_notes (event_id, note, updated_ts_utc)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(event_id) DO UPDATE SET
                 note = excluded.note,
                 updated_ts_utc = excluded.updated_ts_utc",
            params![event_id, note, updated],
        )?;
        Ok(())
    }

    /// Fetch the annotation for an event, if any.
    pub fn get_note(&self, event_id: &str) -> Result<Option<EventNote>> {
        let row = self
            .conn
            .query_row(
                "SELECT event_id, note, updated_ts_utc FROM event_notes WHERE event_id = ?1",
                params![event_id],
                |row| {
                    Ok(EventNote {
                        event_id: row.get(0)?,
                        note: row.get(1)?,
                        updated_ts_utc: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Remove the annotation for an event. Returns whether a row existed.
    pub fn delete_note(&self, event_id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM event_notes WHERE event_id = ?1", params![event_id])?;
        Ok(changed == 1)
    }

    /// Strip heavy payload sections from aged rows, at most `limit` per call.
    ///
    /// Rows whose `ts_epoch_ms` is older than `cutoff_ms` have the
    /// [`HEAVY_PAYLOAD_KEYS`] sections removed from `data_json` and are
    /// marked `slimmed` so they are never re-examined. The extracted columns
    /// are untouched and stay queryable.
    ///
    /// Returns the number of rows slimmed.
    pub fn slim_batch(&mut self, cutoff_ms: i64, limit: usize) -> Result<usize> {
        let tx = self.conn.transaction()?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, data_json FROM events
                 WHERE slimmed = 0 AND ts_epoch_ms < ?1
                 ORDER BY id ASC LIMIT ?2",
            )?;
            stmt.query_map(params![cutoff_ms, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let count = rows.len();
        for (id, data_json) in rows {
            let slimmed_payload = match slim_payload(&data_json) {
                Some(p) => p,
                None => {
                    // Unparseable payload: keep the bytes, still mark the row
                    // so it is not re-examined every run.
                    tracing::warn!("Row {} has unparseable data_json, marking as-is", id);
                    data_json
                }
            };
            tx.execute(
                "UPDATE events SET data_json = ?1, slimmed = 1 WHERE id = ?2",
                params![slimmed_payload, id],
            )?;
        }

        tx.commit()?;
        Ok(count)
    }

    /// Delete rows older than `cutoff_ms`, at most `limit` per call.
    ///
    /// Annotations referencing the deleted rows are removed in the same
    /// transaction. Returns the number of event rows deleted.
    pub fn delete_batch(&mut self, cutoff_ms: i64, limit: usize) -> Result<usize> {
        let tx = self.conn.transaction()?;

        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, event_id FROM events
                 WHERE ts_epoch_ms < ?1
                 ORDER BY id ASC LIMIT ?2",
            )?;
            stmt.query_map(params![cutoff_ms, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let count = rows.len();
        for (id, event_id) in rows {
            tx.execute(
                "DELETE FROM event_notes WHERE event_id = ?1",
                params![event_id],
            )?;
            tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        }

        tx.commit()?;
        Ok(count)
    }

    /// Fold the write-ahead log back into the main store file.
    pub fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
        let result = self.conn.query_row(
            &format!("PRAGMA wal_checkpoint({})", mode.as_str()),
            [],
            |row| {
                Ok(CheckpointResult {
                    busy: row.get(0)?,
                    log_frames: row.get(1)?,
                    checkpointed_frames: row.get(2)?,
                })
            },
        )?;
        Ok(result)
    }

    /// Reclaim freed space at the file level.
    ///
    /// Must run outside any open transaction; intended for standalone
    /// invocation (`store-vacuum`), not the hot loop.
    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM;")?;
        Ok(())
    }

    /// Size of the WAL sidecar file (0 when absent or in-memory).
    pub fn wal_size_bytes(&self) -> u64 {
        let mut wal_path = self.db_path.as_os_str().to_owned();
        wal_path.push("-wal");
        std::fs::metadata(PathBuf::from(wal_path))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Size of the main store file (0 when in-memory).
    pub fn db_size_bytes(&self) -> u64 {
        std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0)
    }

    /// Row count plus file sizes, for the periodic log line and gauges.
    pub fn diagnostics(&self) -> Result<StoreDiagnostics> {
        Ok(StoreDiagnostics {
            event_rows: self.count()?,
            db_bytes: self.db_size_bytes(),
            wal_bytes: self.wal_size_bytes(),
        })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        id: row.get(0)?,
        event_id: row.get(1)?,
        ts_utc: row.get(2)?,
        ts_local: row.get(3)?,
        ts_epoch_ms: row.get(4)?,
        host: row.get(5)?,
        pid: row.get(6)?,
        loop_no: row.get(7)?,
        export_costs: row.get(8)?,
        want_pct: row.get(9)?,
        want_enabled: row.get(10)?,
        reason: row.get(11)?,
        slimmed: row.get::<_, i64>(12)? != 0,
        data_json: row.get(13)?,
    })
}

/// Remove the heavy payload sections, returning the re-serialized payload.
///
/// Returns `None` when the stored payload no longer parses as an object.
fn slim_payload(data_json: &str) -> Option<String> {
    let mut value: serde_json::Value = serde_json::from_str(data_json).ok()?;
    let obj = value.as_object_mut()?;
    for key in HEAVY_PAYLOAD_KEYS {
        obj.remove(*key);
    }
    serde_json::to_string(&value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn event_from_json(value: serde_json::Value) -> DecodedEvent {
        DecodedEvent::decode(value.to_string().as_bytes(), 0).unwrap()
    }

    fn sample_event(event_id: &str, ts_epoch_ms: i64) -> DecodedEvent {
        event_from_json(json!({
            "event_id": event_id,
            "ts_epoch_ms": ts_epoch_ms,
            "decision": { "export_costs": true, "want_pct": 30, "want_enabled": 1,
                          "reason": "cheap hour" },
            "sources": { "et": { "pv_est_w": 3120, "gen_w": 2980 } },
            "meter": { "power_w": -410 }
        }))
    }

    #[test]
    fn test_insert_is_idempotent_on_event_id() {
        let store = EventStore::open_in_memory().unwrap();

        let first = event_from_json(json!({
            "event_id": "ev-1", "ts_epoch_ms": 1000, "decision": { "want_pct": 10 }
        }));
        let second = event_from_json(json!({
            "event_id": "ev-1", "ts_epoch_ms": 2000, "decision": { "want_pct": 99 }
        }));

        assert!(store.insert_event(&first).unwrap());
        assert!(!store.insert_event(&second).unwrap());

        assert_eq!(store.count().unwrap(), 1);

        // First-seen payload is retained
        let row = store.get_by_event_id("ev-1").unwrap().unwrap();
        assert_eq!(row.want_pct, Some(10));
        assert_eq!(row.ts_epoch_ms, Some(1000));
    }

    #[test]
    fn test_latest_and_range_follow_insertion_order() {
        let store = EventStore::open_in_memory().unwrap();

        for i in 1..=5 {
            store
                .insert_event(&sample_event(&format!("ev-{i}"), i * 1000))
                .unwrap();
        }

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.event_id, "ev-5");

        let range = store.range_after(2, 10).unwrap();
        let ids: Vec<&str> = range.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["ev-3", "ev-4", "ev-5"]);

        let limited = store.range_after(0, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_extracted_columns_are_stored() {
        let store = EventStore::open_in_memory().unwrap();
        store.insert_event(&sample_event("ev-1", 1000)).unwrap();

        let row = store.latest().unwrap().unwrap();
        assert_eq!(row.export_costs, Some(1));
        assert_eq!(row.want_pct, Some(30));
        assert_eq!(row.want_enabled, Some(1));
        assert_eq!(row.reason.as_deref(), Some("cheap hour"));
        assert!(!row.slimmed);
    }

    #[test]
    fn test_note_upsert_and_delete() {
        let store = EventStore::open_in_memory().unwrap();

        store.upsert_note("ev-1", "first").unwrap();
        store.upsert_note("ev-1", "second").unwrap();

        let note = store.get_note("ev-1").unwrap().unwrap();
        assert_eq!(note.note.as_deref(), Some("second"));
        assert!(note.updated_ts_utc.is_some());

        assert!(store.delete_note("ev-1").unwrap());
        assert!(!store.delete_note("ev-1").unwrap());
        assert!(store.get_note("ev-1").unwrap().is_none());
    }

    #[test]
    fn test_note_may_reference_absent_event() {
        let store = EventStore::open_in_memory().unwrap();
        store.upsert_note("no-such-event", "dangling").unwrap();
        assert!(store.get_note("no-such-event").unwrap().is_some());
    }

    #[test]
    fn test_slim_batch_strips_heavy_sections() {
        let mut store = EventStore::open_in_memory().unwrap();
        store.insert_event(&sample_event("ev-old", 1000)).unwrap();
        store.insert_event(&sample_event("ev-new", 9000)).unwrap();

        let slimmed = store.slim_batch(5000, 100).unwrap();
        assert_eq!(slimmed, 1);

        let old = store.get_by_event_id("ev-old").unwrap().unwrap();
        assert!(old.slimmed);
        let payload: serde_json::Value = serde_json::from_str(&old.data_json).unwrap();
        assert!(payload.get("sources").is_none());
        assert!(payload.get("meter").is_none());
        assert!(payload.get("decision").is_some());
        // Extracted columns remain queryable
        assert_eq!(old.want_pct, Some(30));
        assert_eq!(old.reason.as_deref(), Some("cheap hour"));

        let new = store.get_by_event_id("ev-new").unwrap().unwrap();
        assert!(!new.slimmed);
        let payload: serde_json::Value = serde_json::from_str(&new.data_json).unwrap();
        assert!(payload.get("sources").is_some());

        // Already-slimmed rows are not re-examined
        assert_eq!(store.slim_batch(5000, 100).unwrap(), 0);
    }

    #[test]
    fn test_slim_batch_is_bounded() {
        let mut store = EventStore::open_in_memory().unwrap();
        for i in 0..10 {
            store
                .insert_event(&sample_event(&format!("ev-{i}"), 1000 + i))
                .unwrap();
        }

        assert_eq!(store.slim_batch(5000, 3).unwrap(), 3);
        assert_eq!(store.slim_batch(5000, 3).unwrap(), 3);
        assert_eq!(store.slim_batch(5000, 100).unwrap(), 4);
    }

    #[test]
    fn test_delete_batch_removes_rows_and_notes() {
        let mut store = EventStore::open_in_memory().unwrap();
        store.insert_event(&sample_event("ev-old", 1000)).unwrap();
        store.insert_event(&sample_event("ev-new", 9000)).unwrap();
        store.upsert_note("ev-old", "will vanish").unwrap();
        store.upsert_note("ev-new", "stays").unwrap();

        let deleted = store.delete_batch(5000, 100).unwrap();
        assert_eq!(deleted, 1);

        assert!(store.get_by_event_id("ev-old").unwrap().is_none());
        assert!(store.get_note("ev-old").unwrap().is_none());
        assert!(store.get_by_event_id("ev-new").unwrap().is_some());
        assert!(store.get_note("ev-new").unwrap().is_some());
    }

    #[test]
    fn test_checkpoint_on_file_store() {
        let tmp = TempDir::new().unwrap();
        let store = EventStore::open(StoreConfig {
            db_path: tmp.path().join("events.sqlite3"),
            ..Default::default()
        })
        .unwrap();

        store.insert_event(&sample_event("ev-1", 1000)).unwrap();

        let result = store.checkpoint(CheckpointMode::Truncate).unwrap();
        assert_eq!(result.busy, 0);
    }

    #[test]
    fn test_reopen_persists_rows() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            db_path: tmp.path().join("events.sqlite3"),
            ..Default::default()
        };

        {
            let store = EventStore::open(config.clone()).unwrap();
            store.insert_event(&sample_event("ev-1", 1000)).unwrap();
        }

        let store = EventStore::open(config).unwrap();
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.latest().unwrap().unwrap().event_id, "ev-1");
    }

    #[test]
    fn test_vacuum_runs_standalone() {
        let tmp = TempDir::new().unwrap();
        let mut store = EventStore::open(StoreConfig {
            db_path: tmp.path().join("events.sqlite3"),
            ..Default::default()
        })
        .unwrap();

        for i in 0..20 {
            store
                .insert_event(&sample_event(&format!("ev-{i}"), i))
                .unwrap();
        }
        store.delete_batch(100, 100).unwrap();
        store.vacuum().unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }
}
