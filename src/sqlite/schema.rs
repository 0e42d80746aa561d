//! Table layout shared by the SQLite stores.

use rusqlite::Connection;
use tracing::info;

pub const SCHEMA_VERSION: i32 = 1;

const TABLES: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    hash TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries (expires_at);

CREATE TABLE IF NOT EXISTS dedupe_jobs (
    hash TEXT PRIMARY KEY,
    job_id TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
    result TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dedupe_jobs_status ON dedupe_jobs (status, created_at);

CREATE TABLE IF NOT EXISTS rate_limits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    priority TEXT CHECK (priority IS NULL OR priority IN ('user', 'background'))
);
CREATE INDEX IF NOT EXISTS idx_rate_limits_resource_timestamp ON rate_limits (resource, timestamp);
CREATE INDEX IF NOT EXISTS idx_rate_limits_resource_priority ON rate_limits (resource, priority, timestamp);
CREATE INDEX IF NOT EXISTS idx_rate_limits_timestamp ON rate_limits (timestamp);
";

/// Create missing tables and indexes. Safe to run on every open.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    conn.execute_batch(TABLES)?;
    if version < SCHEMA_VERSION {
        info!(from = version, to = SCHEMA_VERSION, "initialized sqlite store schema");
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('cache_entries', 'dedupe_jobs', 'rate_limits')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }

    #[test]
    fn test_status_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        let bad = conn.execute(
            "INSERT INTO dedupe_jobs (hash, job_id, status, created_at, updated_at)
             VALUES ('h', 'j', 'done', 0, 0)",
            [],
        );
        assert!(bad.is_err());
    }
}
