//! Embedded SQL backends.
//!
//! All three stores can share one [`SqliteConnection`]; pointing several processes at
//! the same database file shares cache entries, dedupe jobs and rate-limit history
//! between them. Blocking database work runs on tokio's blocking pool.
//!
//! ```rust,no_run
//! use comic_vine::sqlite::{SqliteCacheStore, SqliteConfig, SqliteConnection};
//!
//! # fn main() -> comic_vine::Result<()> {
//! let config = SqliteConfig::new("comic-vine.db");
//! let conn = SqliteConnection::open(&config)?;
//! let cache = SqliteCacheStore::with_connection(conn.clone(), config.clone())?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod dedupe;
mod request_log;
pub mod schema;

pub use cache::SqliteCacheStore;
pub use dedupe::SqliteDedupeStore;
pub use request_log::SqliteRequestLog;

use crate::rate_limit::{RateLimiterConfig, WindowedRateLimiter};
use crate::stores::lock;
use crate::{Error, ErrorContext, Result};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database file; `:memory:` keeps everything in process.
    pub path: PathBuf,
    pub busy_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Pending dedupe jobs older than this are treated as abandoned.
    pub job_timeout: Duration,
    /// How often a dedupe waiter re-reads the job row.
    pub poll_interval: Duration,
    /// Upper bound on a single dedupe wait.
    pub max_wait: Duration,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(":memory:"),
            busy_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(5 * 60),
            job_timeout: Duration::from_secs(5 * 60),
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// A shareable handle to one SQLite connection.
///
/// Clones refer to the same connection. A store built with [`SqliteConnection::open`]
/// through its own `open` constructor owns the connection and closes it on `close()`;
/// a store given an existing handle leaves it open.
#[derive(Clone)]
pub struct SqliteConnection {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteConnection {
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let conn = Connection::open(&config.path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to open sqlite database: {e}"),
                ErrorContext::new()
                    .with_field_path("sqlite.path")
                    .with_details(config.path.display().to_string()),
            )
        })?;
        Self::from_connection(conn, config.busy_timeout)
    }

    /// Adopt an externally created connection; the schema is created if missing.
    pub fn from_connection(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)?;
        // In-memory databases report "memory" and ignore WAL.
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    pub(crate) async fn call<F, T>(&self, store: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = lock(&conn);
            match guard.as_mut() {
                Some(conn) => f(conn),
                None => Err(Error::StoreDestroyed { store }),
            }
        })
        .await
        .map_err(|e| {
            Error::runtime_with_context(
                format!("sqlite task failed: {e}"),
                ErrorContext::new().with_source(store),
            )
        })?
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.conn).is_none()
    }

    /// Close the connection for every clone of this handle.
    pub fn close(&self) {
        lock(&self.conn).take();
    }
}

pub type SqliteRateLimitStore = WindowedRateLimiter<SqliteRequestLog>;

impl SqliteRateLimitStore {
    pub fn sqlite(conn: SqliteConnection, owned: bool, config: RateLimiterConfig) -> Self {
        WindowedRateLimiter::new(SqliteRequestLog::new(conn, owned), config)
    }
}
