//! Outbound HTTP.
//!
//! The orchestrator only needs "fetch this URL and give me JSON", so that is the
//! whole [`Transport`] trait. [`HttpTransport`] is the reqwest implementation.

mod http;

pub use http::{HttpConfig, HttpTransport};

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Other(String),
}
