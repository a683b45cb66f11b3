//! SQLite schema for the event store.
//!
//! This module defines the database schema and provides migration utilities.
//! Schema creation is idempotent and safe to run against an existing store;
//! new columns are only ever added, never changed or removed, so older
//! readers keep working against an upgraded file.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist and runs any pending migrations.
pub fn init_schema(conn: &Connection) -> Result<()> {
    // Check current version
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        // Fresh database - create all tables
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        // Run migrations
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }

    // Additive columns are ensured unconditionally so a store created by any
    // earlier build upgrades in place.
    ensure_column(conn, "events", "slimmed", "INTEGER NOT NULL DEFAULT 0")?;

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    // Create version table if it doesn't exist
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Create all tables for a fresh database.
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per accepted telemetry/decision sample
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT NOT NULL UNIQUE,
            ts_utc TEXT,
            ts_local TEXT,
            ts_epoch_ms INTEGER,
            host TEXT,
            pid INTEGER,
            loop INTEGER,
            export_costs INTEGER,
            want_pct INTEGER,
            want_enabled INTEGER,
            reason TEXT,
            slimmed INTEGER NOT NULL DEFAULT 0,
            data_json TEXT NOT NULL
        );

        -- User annotations, independent lifecycle; may reference an event
        -- that does not (or no longer) exist
        CREATE TABLE IF NOT EXISTS event_notes (
            event_id TEXT PRIMARY KEY,
            note TEXT,
            updated_ts_utc TEXT
        );

        -- Indexes for efficient queries
        CREATE INDEX IF NOT EXISTS idx_events_ts_epoch_ms ON events(ts_epoch_ms);
        CREATE INDEX IF NOT EXISTS idx_events_event_id ON events(event_id);
        "#,
    )?;

    Ok(())
}

/// Run migrations from one version to another.
fn migrate(conn: &Connection, from: i32, to: i32) -> Result<()> {
    for version in from..to {
        if version == 1 {
            migrate_v1_to_v2(conn)?;
        }
    }
    set_schema_version(conn, to)?;
    Ok(())
}

/// Migrate from v1 to v2: add the `slimmed` retention marker column.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    ensure_column(conn, "events", "slimmed", "INTEGER NOT NULL DEFAULT 0")
}

/// Add a column if it is not already present.
fn ensure_column(conn: &Connection, table: &str, column: &str, sql_type: &str) -> Result<()> {
    if table_has_column(conn, table, column)? {
        return Ok(());
    }

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {sql_type}"),
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_init_schema_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"events".to_string()));
        assert!(tables.contains(&"event_notes".to_string()));
    }

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap(); // Should not fail
    }

    #[test]
    fn test_slimmed_column_added_to_v1_store() {
        let conn = Connection::open_in_memory().unwrap();

        // Simulate a v1 store that predates the retention marker
        conn.execute_batch(
            r#"
            CREATE TABLE events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL UNIQUE,
                ts_epoch_ms INTEGER,
                data_json TEXT NOT NULL
            );
            CREATE TABLE event_notes (
                event_id TEXT PRIMARY KEY,
                note TEXT,
                updated_ts_utc TEXT
            );
            CREATE TABLE schema_version (version INTEGER NOT NULL);
            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )
        .unwrap();

        init_schema(&conn).unwrap();

        assert!(table_has_column(&conn, "events", "slimmed").unwrap());

        // Pre-existing rows default to not slimmed
        conn.execute(
            "INSERT INTO events (event_id, ts_epoch_ms, data_json) VALUES ('e1', 0, '{}')",
            [],
        )
        .unwrap();
        let slimmed: i64 = conn
            .query_row("SELECT slimmed FROM events WHERE event_id = 'e1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(slimmed, 0);
    }

    #[test]
    fn test_ensure_column_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        ensure_column(&conn, "events", "slimmed", "INTEGER NOT NULL DEFAULT 0").unwrap();
    }
}
