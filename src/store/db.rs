//! Shared SQLite handle and schema

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::types::StoreError;

/// Shared SQLite connection for all entity stores.
pub struct Database {
    pub(crate) conn: tokio::sync::Mutex<rusqlite::Connection>,
}

impl Database {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> Result<Arc<Self>, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Sqlite(format!("create dir: {e}")))?;
        }
        let conn = rusqlite::Connection::open(path)?;

        // WAL mode for concurrent access.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::init_schema(&conn)?;

        Ok(Arc::new(Self {
            conn: tokio::sync::Mutex::new(conn),
        }))
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Arc<Self>, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Arc::new(Self {
            conn: tokio::sync::Mutex::new(conn),
        }))
    }

    fn init_schema(conn: &rusqlite::Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);

            CREATE TABLE IF NOT EXISTS jobs (
                id                  TEXT PRIMARY KEY,
                owner               TEXT NOT NULL,
                hashlist_id         TEXT NOT NULL,
                attack_mode         INTEGER NOT NULL,
                spec_json           TEXT NOT NULL,
                plan_json           TEXT NOT NULL,
                hash_type           INTEGER NOT NULL,
                slow_hash           INTEGER NOT NULL DEFAULT 0,
                binary_version      TEXT NOT NULL,
                priority            INTEGER NOT NULL,
                max_agents          INTEGER NOT NULL DEFAULT 0,
                allow_preempt       INTEGER NOT NULL DEFAULT 0,
                chunk_duration_secs INTEGER,
                effective_keyspace  INTEGER NOT NULL,
                unbounded           INTEGER NOT NULL DEFAULT 0,
                processed_keyspace  INTEGER NOT NULL DEFAULT 0,
                dispatched_keyspace INTEGER NOT NULL DEFAULT 0,
                progress_percent    REAL NOT NULL DEFAULT 0,
                status              TEXT NOT NULL DEFAULT 'pending',
                uses_rule_splitting INTEGER NOT NULL DEFAULT 0,
                rule_chunks_json    TEXT NOT NULL DEFAULT '[]',
                last_error          TEXT,
                created_at          TEXT NOT NULL,
                updated_at          TEXT NOT NULL,
                completed_at        TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id                  TEXT PRIMARY KEY,
                job_id              TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                agent_id            TEXT,
                keyspace_start      INTEGER NOT NULL,
                keyspace_end        INTEGER NOT NULL,
                effective_start     INTEGER,
                effective_end       INTEGER,
                keyspace_processed  INTEGER NOT NULL DEFAULT 0,
                effective_processed INTEGER NOT NULL DEFAULT 0,
                rule_chunk_index    INTEGER,
                status              TEXT NOT NULL DEFAULT 'pending',
                retry_count         INTEGER NOT NULL DEFAULT 0,
                last_seq            INTEGER NOT NULL DEFAULT 0,
                cancel_reason       TEXT,
                created_at          TEXT NOT NULL,
                started_at          TEXT,
                completed_at        TEXT,
                last_progress_at    TEXT
            );

            CREATE TABLE IF NOT EXISTS agents (
                id                   TEXT PRIMARY KEY,
                name                 TEXT NOT NULL,
                status               TEXT NOT NULL DEFAULT 'pending',
                enabled              INTEGER NOT NULL DEFAULT 1,
                devices_json         TEXT NOT NULL DEFAULT '[]',
                hash_types_json      TEXT NOT NULL DEFAULT '[]',
                binary_versions_json TEXT NOT NULL DEFAULT '[]',
                schedule_json        TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS benchmarks (
                agent_id          TEXT NOT NULL,
                attack_mode       INTEGER NOT NULL,
                hash_type         INTEGER NOT NULL,
                binary_version    TEXT NOT NULL,
                hashes_per_second INTEGER NOT NULL,
                captured_at       TEXT NOT NULL,
                PRIMARY KEY (agent_id, attack_mode, hash_type, binary_version)
            );

            CREATE TABLE IF NOT EXISTS rule_chunks (
                chunk_id   TEXT PRIMARY KEY,
                path       TEXT NOT NULL,
                line_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS association_maps (
                hashlist_id TEXT PRIMARY KEY,
                path        TEXT NOT NULL,
                line_count  INTEGER NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_priority ON jobs(priority, created_at);
            CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);",
        )?;
        Ok(())
    }
}

// ── Timestamp helpers ─────────────────────────────────────────────────

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

pub(crate) fn ts_opt(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|t| t.to_rfc3339())
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn parse_ts_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.map(|v| parse_ts(&v)).transpose()
}

/// Extension trait so we can use `optional()` on rusqlite queries.
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_initializes_in_memory() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('jobs', 'tasks', 'agents', 'benchmarks', 'rule_chunks', 'association_maps')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 6);
    }

    #[test]
    fn timestamps_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&ts(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
        assert!(parse_ts("not a time").is_err());
        assert_eq!(parse_ts_opt(None).unwrap(), None);
    }
}
