//! Cache, dedupe and rate-limit orchestration around one upstream call.
//!
//! For every [`ApiRequest`] the orchestrator:
//! 1. fingerprints endpoint + params and returns a live cache entry if present
//! 2. registers the fingerprint with the dedupe store; a non-owner waits for the
//!    owner's result and only does the work itself if the owner failed
//! 3. checks the rate limiter, waiting or rejecting per [`RateLimitBehavior`]
//! 4. records the request, performs it, caches the result and resolves waiters
//!
//! Store failures never fail a request: reads degrade to misses and writes are
//! logged and skipped. Only upstream errors and rate-limit rejections reach the
//! caller.

use super::urls::UrlBuilder;
use crate::fingerprint::{Params, RequestKey};
use crate::stores::{CacheStore, DedupeStore, Priority, RateLimitStore, WaitOutcome};
use crate::telemetry::{observe, StoreMonitor};
use crate::transport::Transport;
use crate::{Error, Result};
use serde_json::Value;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to do when the rate limiter says no.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitBehavior {
    /// Sleep until capacity frees up, up to `max_rate_limit_wait`.
    Wait,
    /// Fail immediately with [`Error::RateLimited`].
    Reject,
}

impl FromStr for RateLimitBehavior {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wait" => Ok(RateLimitBehavior::Wait),
            "reject" => Ok(RateLimitBehavior::Reject),
            other => Err(Error::validation_with_context(
                format!("unknown rate limit behavior '{other}'"),
                crate::ErrorContext::new().with_field_path("orchestrator.rate_limit_behavior"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cache_ttl: Duration,
    pub rate_limit_behavior: RateLimitBehavior,
    pub max_rate_limit_wait: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(3600),
            rate_limit_behavior: RateLimitBehavior::Wait,
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `COMIC_VINE_CACHE_TTL_SECS`,
    /// `COMIC_VINE_RATE_LIMIT_BEHAVIOR` (`wait` / `reject`) and
    /// `COMIC_VINE_MAX_RATE_LIMIT_WAIT_SECS`. Unparsable values are ignored.
    pub fn from_env() -> Self {
        let secs = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        let mut config = Self::default();
        if let Some(ttl) = secs("COMIC_VINE_CACHE_TTL_SECS") {
            config.cache_ttl = ttl;
        }
        if let Some(behavior) = std::env::var("COMIC_VINE_RATE_LIMIT_BEHAVIOR")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.rate_limit_behavior = behavior;
        }
        if let Some(wait) = secs("COMIC_VINE_MAX_RATE_LIMIT_WAIT_SECS") {
            config.max_rate_limit_wait = wait;
        }
        config
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_rate_limit_behavior(mut self, behavior: RateLimitBehavior) -> Self {
        self.rate_limit_behavior = behavior;
        self
    }

    pub fn with_max_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.max_rate_limit_wait = wait;
        self
    }
}

/// One upstream call as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// Path relative to the API base, e.g. `issue/4000-6/`.
    pub endpoint: String,
    pub params: Params,
    /// Rate-limit bucket.
    pub resource: String,
    pub priority: Priority,
}

impl ApiRequest {
    pub fn new(endpoint: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: Params::new(),
            resource: resource.into(),
            priority: Priority::User,
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.endpoint.as_str(), &self.params)
    }
}

/// Checks a decoded response before it is cached or handed to waiters.
pub type ResponseValidator = fn(&Value) -> Result<()>;

pub struct RequestOrchestrator {
    transport: Arc<dyn Transport>,
    urls: UrlBuilder,
    cache: Option<Arc<dyn CacheStore>>,
    dedupe: Option<Arc<dyn DedupeStore>>,
    rate_limiter: Option<Arc<dyn RateLimitStore>>,
    monitor: Option<Arc<StoreMonitor>>,
    validator: Option<ResponseValidator>,
    config: OrchestratorConfig,
}

/// Builder for [`RequestOrchestrator`]. Every store is optional.
pub struct RequestOrchestratorBuilder {
    cache: Option<Arc<dyn CacheStore>>,
    dedupe: Option<Arc<dyn DedupeStore>>,
    rate_limiter: Option<Arc<dyn RateLimitStore>>,
    monitor: Option<Arc<StoreMonitor>>,
    validator: Option<ResponseValidator>,
    config: OrchestratorConfig,
}

impl RequestOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            cache: None,
            dedupe: None,
            rate_limiter: None,
            monitor: None,
            validator: None,
            config: OrchestratorConfig::default(),
        }
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn dedupe(mut self, dedupe: Arc<dyn DedupeStore>) -> Self {
        self.dedupe = Some(dedupe);
        self
    }

    pub fn rate_limiter(mut self, rate_limiter: Arc<dyn RateLimitStore>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Time every store call and accumulate the timings in `monitor`.
    pub fn monitor(mut self, monitor: Arc<StoreMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn validator(mut self, validator: ResponseValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>, urls: UrlBuilder) -> RequestOrchestrator {
        info!(
            cache = self.cache.as_ref().map_or("none", |s| s.name()),
            dedupe = self.dedupe.as_ref().map_or("none", |s| s.name()),
            rate_limit = self.rate_limiter.is_some(),
            "request orchestrator ready"
        );
        RequestOrchestrator {
            transport,
            urls,
            cache: self.cache,
            dedupe: self.dedupe,
            rate_limiter: self.rate_limiter,
            monitor: self.monitor,
            validator: self.validator,
            config: self.config,
        }
    }
}

impl Default for RequestOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestOrchestrator {
    pub fn builder() -> RequestOrchestratorBuilder {
        RequestOrchestratorBuilder::new()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn urls(&self) -> &UrlBuilder {
        &self.urls
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    pub fn dedupe(&self) -> Option<&Arc<dyn DedupeStore>> {
        self.dedupe.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&Arc<dyn RateLimitStore>> {
        self.rate_limiter.as_ref()
    }

    pub(crate) fn set_validator(&mut self, validator: ResponseValidator) {
        self.validator = Some(validator);
    }

    async fn observed<T, F>(&self, op: &'static str, correlation_id: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match &self.monitor {
            Some(monitor) => observe(monitor, op, correlation_id, call).await,
            None => call.await,
        }
    }

    pub async fn execute(&self, request: &ApiRequest) -> Result<Value> {
        let key = request.key();
        let hash = key.as_str();
        let cid = uuid::Uuid::new_v4().simple().to_string();

        if let Some(cache) = &self.cache {
            match self.observed("cache.get", &cid, cache.get(hash)).await {
                Ok(Some(value)) => {
                    debug!(endpoint = %request.endpoint, hash, "cache hit");
                    return Ok(value);
                }
                Ok(None) => {}
                Err(e) => warn!(hash, error = %e, "cache read failed, treating as miss"),
            }
        }

        let mut owner = false;
        if let Some(dedupe) = &self.dedupe {
            match self.observed("dedupe.register", &cid, dedupe.register(hash)).await {
                Ok(registration) if registration.owner => owner = true,
                Ok(registration) => {
                    debug!(hash, job_id = %registration.job_id, "joining in-flight request");
                    match self
                        .observed("dedupe.wait", &cid, dedupe.wait_outcome(hash))
                        .await
                    {
                        Ok(WaitOutcome::Completed(value)) => return Ok(value),
                        Ok(WaitOutcome::Failed(reason)) => {
                            debug!(hash, reason = %reason, "in-flight request failed, retrying here")
                        }
                        Ok(WaitOutcome::Missing) => {}
                        Err(e) => debug!(hash, error = %e, "gave up waiting on in-flight request"),
                    }
                }
                Err(e) => warn!(hash, error = %e, "dedupe registration failed"),
            }
        }

        let result = self.admit_and_fetch(request, &cid).await;

        match &result {
            Ok(value) => {
                self.store(hash, value, &cid).await;
                if owner {
                    if let Some(dedupe) = &self.dedupe {
                        if let Err(e) = self
                            .observed("dedupe.complete", &cid, dedupe.complete(hash, value))
                            .await
                        {
                            warn!(hash, error = %e, "failed to complete dedupe job");
                        }
                    }
                }
            }
            Err(err) => {
                if owner {
                    if let Some(dedupe) = &self.dedupe {
                        let reason = err.to_string();
                        if let Err(e) = self
                            .observed("dedupe.fail", &cid, dedupe.fail(hash, &reason))
                            .await
                        {
                            warn!(hash, error = %e, "failed to fail dedupe job");
                        }
                    }
                }
            }
        }
        result
    }

    async fn admit_and_fetch(&self, request: &ApiRequest, cid: &str) -> Result<Value> {
        if let Some(limiter) = &self.rate_limiter {
            self.admit(limiter.as_ref(), request, cid).await?;
        }
        let url = self.urls.url(&request.endpoint, &request.params)?;
        let value = self.transport.get(&url).await?;
        if let Some(validate) = self.validator {
            validate(&value)?;
        }
        Ok(value)
    }

    async fn admit(&self, limiter: &dyn RateLimitStore, request: &ApiRequest, cid: &str) -> Result<()> {
        let resource = request.resource.as_str();
        let priority = Some(request.priority);
        let mut waited = Duration::ZERO;

        loop {
            let allowed = match self
                .observed("rate_limit.check", cid, limiter.can_proceed_with(resource, priority))
                .await
            {
                Ok(allowed) => allowed,
                Err(e) => {
                    warn!(resource, error = %e, "rate limit check failed, admitting");
                    true
                }
            };
            if allowed {
                break;
            }

            let wait = limiter
                .wait_time_with(resource, priority)
                .await
                .unwrap_or(Duration::from_millis(100))
                .max(Duration::from_millis(1));
            let rejected = Error::RateLimited {
                resource: resource.to_string(),
                wait_ms: wait.as_millis() as u64,
            };
            if self.config.rate_limit_behavior == RateLimitBehavior::Reject {
                return Err(rejected);
            }
            if waited + wait > self.config.max_rate_limit_wait {
                warn!(resource, wait_ms = wait.as_millis() as u64, "rate limit wait exceeds budget");
                return Err(rejected);
            }
            debug!(resource, priority = %request.priority, wait_ms = wait.as_millis() as u64, "rate limited, waiting");
            tokio::time::sleep(wait).await;
            waited += wait;
        }

        if let Err(e) = self
            .observed("rate_limit.record", cid, limiter.record_with(resource, priority))
            .await
        {
            warn!(resource, error = %e, "failed to record request");
        }
        Ok(())
    }

    async fn store(&self, hash: &str, value: &Value, cid: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        match self
            .observed("cache.set", cid, cache.set(hash, value, self.config.cache_ttl))
            .await
        {
            Ok(()) => {}
            Err(Error::ItemTooLarge { size, limit }) => {
                warn!(hash, size, limit, "response too large to cache, skipping");
            }
            Err(e) => warn!(hash, error = %e, "cache write failed"),
        }
    }

    /// Close every configured store, returning the first error after all have been tried.
    pub async fn close(&self) -> Result<()> {
        let mut results = Vec::with_capacity(3);
        if let Some(cache) = &self.cache {
            results.push(cache.close().await);
        }
        if let Some(dedupe) = &self.dedupe {
            results.push(dedupe.close().await);
        }
        if let Some(limiter) = &self.rate_limiter {
            results.push(limiter.close().await);
        }
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }
}
