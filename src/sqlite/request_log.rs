use super::SqliteConnection;
use crate::rate_limit::RequestLog;
use crate::stores::Priority;
use crate::Result;
use async_trait::async_trait;
use rusqlite::params;

const STORE: &str = "sqlite_rate_limit";

/// One row per request in the `rate_limits` table.
pub struct SqliteRequestLog {
    conn: SqliteConnection,
    owned: bool,
}

impl SqliteRequestLog {
    pub fn new(conn: SqliteConnection, owned: bool) -> Self {
        Self { conn, owned }
    }
}

#[async_trait]
impl RequestLog for SqliteRequestLog {
    async fn append(&self, resource: &str, priority: Option<Priority>, at_ms: i64) -> Result<()> {
        let resource = resource.to_string();
        let priority = priority.map(|p| p.as_str());
        self.conn
            .call(STORE, move |conn| {
                conn.execute(
                    "INSERT INTO rate_limits (resource, timestamp, priority) VALUES (?1, ?2, ?3)",
                    params![resource, at_ms, priority],
                )?;
                Ok(())
            })
            .await
    }

    async fn timestamps(
        &self,
        resource: &str,
        priority: Option<Priority>,
        since_ms: i64,
    ) -> Result<Vec<i64>> {
        let resource = resource.to_string();
        self.conn
            .call(STORE, move |conn| {
                let rows = match priority {
                    Some(p) => {
                        let mut stmt = conn.prepare_cached(
                            "SELECT timestamp FROM rate_limits
                             WHERE resource = ?1 AND priority = ?2 AND timestamp > ?3
                             ORDER BY timestamp ASC",
                        )?;
                        let rows = stmt
                            .query_map(params![resource, p.as_str(), since_ms], |row| row.get(0))?
                            .collect::<rusqlite::Result<Vec<i64>>>()?;
                        rows
                    }
                    None => {
                        let mut stmt = conn.prepare_cached(
                            "SELECT timestamp FROM rate_limits
                             WHERE resource = ?1 AND timestamp > ?2
                             ORDER BY timestamp ASC",
                        )?;
                        let rows = stmt
                            .query_map(params![resource, since_ms], |row| row.get(0))?
                            .collect::<rusqlite::Result<Vec<i64>>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }

    async fn last_seen(&self, resource: &str, priority: Priority) -> Result<Option<i64>> {
        let resource = resource.to_string();
        self.conn
            .call(STORE, move |conn| {
                let last: Option<i64> = conn.query_row(
                    "SELECT MAX(timestamp) FROM rate_limits WHERE resource = ?1 AND priority = ?2",
                    params![resource, priority.as_str()],
                    |row| row.get(0),
                )?;
                Ok(last)
            })
            .await
    }

    async fn clear(&self, resource: &str) -> Result<()> {
        let resource = resource.to_string();
        self.conn
            .call(STORE, move |conn| {
                conn.execute("DELETE FROM rate_limits WHERE resource = ?1", params![resource])?;
                Ok(())
            })
            .await
    }

    async fn prune_resource(&self, resource: &str, before_ms: i64) -> Result<u64> {
        let resource = resource.to_string();
        self.conn
            .call(STORE, move |conn| {
                let removed = conn.execute(
                    "DELETE FROM rate_limits WHERE resource = ?1 AND timestamp <= ?2",
                    params![resource, before_ms],
                )?;
                Ok(removed as u64)
            })
            .await
    }

    async fn prune(&self, before_ms: i64) -> Result<u64> {
        self.conn
            .call(STORE, move |conn| {
                let removed = conn.execute(
                    "DELETE FROM rate_limits WHERE timestamp <= ?1",
                    params![before_ms],
                )?;
                Ok(removed as u64)
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.owned {
            self.conn.close();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        STORE
    }
}
