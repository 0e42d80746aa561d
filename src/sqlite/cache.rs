use super::{SqliteConfig, SqliteConnection};
use crate::stores::{duration_ms, lock, now_ms, CacheStats, CacheStore};
use crate::sweeper::Sweeper;
use crate::{Error, Result};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

const STORE: &str = "sqlite_cache";

/// Cache rows in the `cache_entries` table.
pub struct SqliteCacheStore {
    conn: SqliteConnection,
    owned: bool,
    closed: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl SqliteCacheStore {
    /// Open a database of its own, closed together with the store.
    pub fn open(config: SqliteConfig) -> Result<Self> {
        let conn = SqliteConnection::open(&config)?;
        Ok(Self::build(conn, true, &config))
    }

    /// Share an existing connection; `close()` leaves it open.
    pub fn with_connection(conn: SqliteConnection, config: SqliteConfig) -> Result<Self> {
        if conn.is_closed() {
            return Err(Error::StoreDestroyed { store: STORE });
        }
        Ok(Self::build(conn, false, &config))
    }

    fn build(conn: SqliteConnection, owned: bool, config: &SqliteConfig) -> Self {
        let sweep_conn = conn.clone();
        let sweeper = Sweeper::spawn(STORE, config.cleanup_interval, move || {
            if sweep_conn.is_closed() {
                return None;
            }
            let conn = sweep_conn.clone();
            Some(async move { conn.call(STORE, |c| delete_expired(c, now_ms())).await })
        });
        Self {
            conn,
            owned,
            closed: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweeper: Mutex::new(sweeper),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::StoreDestroyed { store: STORE })
        } else {
            Ok(())
        }
    }
}

fn delete_expired(conn: &mut rusqlite::Connection, now: i64) -> Result<u64> {
    let removed = conn.execute(
        "DELETE FROM cache_entries WHERE expires_at <= ?1",
        params![now],
    )?;
    Ok(removed as u64)
}

#[async_trait]
impl CacheStore for SqliteCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let key = key.to_string();
        let value = self
            .conn
            .call(STORE, move |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT value, expires_at FROM cache_entries WHERE hash = ?1",
                        params![key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((raw, expires_at)) = row else {
                    return Ok(None);
                };
                if expires_at <= now_ms() {
                    conn.execute("DELETE FROM cache_entries WHERE hash = ?1", params![key])?;
                    return Ok(None);
                }
                match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        warn!(hash = %key, error = %e, "purging undecodable cache entry");
                        conn.execute("DELETE FROM cache_entries WHERE hash = ?1", params![key])?;
                        Ok(None)
                    }
                }
            })
            .await?;
        let counter = if value.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let key = key.to_string();
        let raw = serde_json::to_string(value)?;
        let now = now_ms();
        let expires_at = now.saturating_add(duration_ms(ttl));
        self.conn
            .call(STORE, move |conn| {
                conn.execute(
                    "INSERT INTO cache_entries (hash, value, expires_at, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(hash) DO UPDATE SET
                         value = excluded.value,
                         expires_at = excluded.expires_at,
                         created_at = excluded.created_at",
                    params![key, raw, expires_at, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let key = key.to_string();
        self.conn
            .call(STORE, move |conn| {
                conn.execute("DELETE FROM cache_entries WHERE hash = ?1", params![key])?;
                Ok(())
            })
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.conn
            .call(STORE, |conn| {
                conn.execute("DELETE FROM cache_entries", [])?;
                Ok(())
            })
            .await
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.ensure_open()?;
        let (items, memory_bytes) = self
            .conn
            .call(STORE, |conn| {
                let row = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(LENGTH(value) + LENGTH(hash)), 0)
                     FROM cache_entries WHERE expires_at > ?1",
                    params![now_ms()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?;
                Ok(row)
            })
            .await?;
        Ok(CacheStats {
            items: items as u64,
            memory_bytes: memory_bytes as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: 0,
        })
    }

    async fn cleanup(&self) -> Result<u64> {
        self.ensure_open()?;
        self.conn
            .call(STORE, |conn| delete_expired(conn, now_ms()))
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.sweeper).take();
        if self.owned {
            self.conn.close();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        STORE
    }
}
