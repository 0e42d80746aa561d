use super::{Transport, TransportError};
use crate::remote::error_code::{RemoteError, RemoteErrorCode};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Proxy;
use serde_json::Value;
use std::env;
use std::time::Duration;
use tracing::debug;
use url::Url;

const USER_AGENT: &str = concat!("comic-vine-rs/", env!("CARGO_PKG_VERSION"));
/// Upper bound on how much of an error body ends up in the error message.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub proxy: Option<String>,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
            proxy: None,
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl HttpConfig {
    /// Defaults overridden by `COMIC_VINE_HTTP_TIMEOUT_SECS`,
    /// `COMIC_VINE_HTTP_POOL_MAX_IDLE_PER_HOST` and `COMIC_VINE_PROXY_URL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(secs) = env::var("COMIC_VINE_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(idle) = env::var("COMIC_VINE_HTTP_POOL_MAX_IDLE_PER_HOST")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            config.pool_max_idle_per_host = idle;
        }
        config.proxy = env::var("COMIC_VINE_PROXY_URL").ok();
        config
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(config.pool_idle_timeout))
            .user_agent(config.user_agent);

        if let Some(proxy_url) = &config.proxy {
            let proxy = Proxy::all(proxy_url)
                .map_err(|e| Error::Transport(TransportError::Other(format!("invalid proxy: {e}"))))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;
        Ok(Self { client })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(HttpConfig::from_env())
    }
}

/// `api_key` must never reach the logs.
fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "api_key" { "***".into() } else { v.into_owned() };
            (k.into_owned(), v)
        })
        .collect();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<Value> {
        debug!(url = %redacted(url), "GET");
        let response = self
            .client
            .get(url.clone())
            .header("accept", "application/json")
            .send()
            .await
            .map_err(TransportError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(
                body.char_indices()
                    .nth(ERROR_BODY_LIMIT)
                    .map_or(body.len(), |(i, _)| i),
            );
            return Err(RemoteError::new(
                RemoteErrorCode::from_http_status(status.as_u16()),
                format!("HTTP {status}: {body}"),
            )
            .into());
        }

        Ok(response.json().await.map_err(TransportError::Http)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_api_key() {
        let url = Url::parse("https://example.test/api/issues/?api_key=secret&format=json").unwrap();
        let shown = redacted(&url);
        assert!(!shown.contains("secret"));
        assert!(shown.contains("format=json"));
    }
}
