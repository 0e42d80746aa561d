//! Comic Vine client layer.
//!
//! | Type | Role |
//! |------|------|
//! | [`ResourceType`] | resource registry: detail/list paths and type ids |
//! | [`UrlBuilder`] | renders endpoints into URLs with the API key attached |
//! | [`RequestOrchestrator`] | cache → dedupe → rate limit → upstream |
//! | [`ComicVineClient`] | typed `retrieve` / `list` on top of the orchestrator |
//!
//! ```rust,no_run
//! use comic_vine::client::{
//!     ComicVineClient, ListOptions, RequestOrchestrator, ResourceType, UrlBuilder,
//! };
//! use comic_vine::memory::{MemoryCacheConfig, MemoryCacheStore};
//! use comic_vine::transport::HttpTransport;
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! # #[tokio::main] async fn main() -> comic_vine::Result<()> {
//! let orchestrator = RequestOrchestrator::builder()
//!     .cache(Arc::new(MemoryCacheStore::new(MemoryCacheConfig::default())))
//!     .build(Arc::new(HttpTransport::from_env()?), UrlBuilder::new("api-key")?);
//! let client = ComicVineClient::new(orchestrator);
//! let page = client
//!     .list::<Value>(ResourceType::Issue, &ListOptions::new().with_limit(10))
//!     .await?;
//! println!("{} issues", page.number_of_total_results);
//! # Ok(()) }
//! ```

mod comic_vine;
mod orchestrator;
mod resources;
mod urls;

pub use comic_vine::{check_status, ApiResponse, ComicVineClient};
pub use orchestrator::{
    ApiRequest, OrchestratorConfig, RateLimitBehavior, RequestOrchestrator,
    RequestOrchestratorBuilder, ResponseValidator,
};
pub use resources::ResourceType;
pub use urls::{ListOptions, RetrieveOptions, SortDirection, UrlBuilder, DEFAULT_BASE_URL};
