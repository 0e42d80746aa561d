//! # comic-vine
//!
//! Comic Vine API client with request orchestration: every outbound call is
//! fingerprinted, served from cache when possible, collapsed with identical
//! in-flight calls, and admitted by a sliding-window rate limiter that can split
//! capacity between user and background traffic.
//!
//! ## Stores
//!
//! The three store families are traits with one implementation per backend, so
//! the orchestrator never sees backend types:
//!
//! | Trait | memory | sqlite | remote |
//! |-------|--------|--------|--------|
//! | [`CacheStore`] | [`memory::MemoryCacheStore`] | [`sqlite::SqliteCacheStore`] | [`remote::RemoteCacheStore`] |
//! | [`DedupeStore`] | [`memory::MemoryDedupeStore`] | [`sqlite::SqliteDedupeStore`] | [`remote::RemoteDedupeStore`] |
//! | [`RateLimitStore`] | [`memory::MemoryRateLimitStore`] | [`sqlite::SqliteRateLimitStore`] | [`remote::RemoteRateLimitStore`] |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use comic_vine::client::{ComicVineClient, RequestOrchestrator, ResourceType, RetrieveOptions, UrlBuilder};
//! use comic_vine::sqlite::{SqliteCacheStore, SqliteConfig};
//! use comic_vine::transport::HttpTransport;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> comic_vine::Result<()> {
//!     let cache = SqliteCacheStore::open(SqliteConfig::new("comic-vine.db"))?;
//!     let orchestrator = RequestOrchestrator::builder()
//!         .cache(Arc::new(cache))
//!         .build(Arc::new(HttpTransport::from_env()?), UrlBuilder::new("your-api-key")?);
//!     let client = ComicVineClient::new(orchestrator);
//!
//!     let issue = client
//!         .retrieve::<Value>(ResourceType::Issue, 6, &RetrieveOptions::new())
//!         .await?;
//!     println!("{}", issue.results["name"]);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | URL building, resource registry, orchestrator, typed client |
//! | [`fingerprint`] | request hashing |
//! | [`stores`] | store traits and shared value types |
//! | [`rate_limit`] | sliding-window limiter and adaptive capacity |
//! | [`memory`] | in-process backends |
//! | [`sqlite`] | embedded SQL backends |
//! | [`remote`] | remote key-value table backends |
//! | [`resilience`] | circuit breaker and retry policy |
//! | [`telemetry`] | store call instrumentation |
//! | [`transport`] | HTTP transport |

pub mod client;
pub mod fingerprint;
pub mod memory;
pub mod rate_limit;
pub mod remote;
pub mod resilience;
pub mod sqlite;
pub mod stores;
pub mod telemetry;
pub mod transport;

mod sweeper;

pub use client::{ApiRequest, ComicVineClient, RequestOrchestrator};
pub use fingerprint::{fingerprint, Params, RequestKey};
pub use stores::{CacheStore, DedupeStore, Priority, RateLimitStore};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
