use crate::stores::{duration_ms, lock, now_ms, CacheStats, CacheStore};
use crate::sweeper::Sweeper;
use crate::{Error, Result};
use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const STORE: &str = "memory_cache";

#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    pub max_items: usize,
    pub max_memory_bytes: usize,
    /// Share of capacity freed when a bound is hit.
    pub eviction_ratio: f64,
    pub cleanup_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_items: 1000,
            max_memory_bytes: 50 * 1024 * 1024,
            eviction_ratio: 0.1,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl MemoryCacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.max(1);
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_eviction_ratio(mut self, ratio: f64) -> Self {
        self.eviction_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

struct Entry {
    value: Value,
    size: usize,
    expires_at_ms: i64,
}

struct State {
    entries: LruCache<String, Entry>,
    memory_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl State {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(old) => {
                self.memory_bytes -= old.size;
                true
            }
            None => false,
        }
    }

    fn purge_expired(&mut self, now: i64) -> u64 {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at_ms <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len() as u64
    }

    fn evict_lru_while(&mut self, mut over: impl FnMut(&State) -> bool) {
        while over(self) {
            match self.entries.pop_lru() {
                Some((_, old)) => {
                    self.memory_bytes -= old.size;
                    self.evictions += 1;
                }
                None => break,
            }
        }
    }

    /// Make room for one more entry of `incoming` bytes.
    fn make_room(&mut self, cfg: &MemoryCacheConfig, incoming: usize, now: i64) {
        let items_full = |s: &State| s.entries.len() >= cfg.max_items;
        let bytes_full = |s: &State| s.memory_bytes + incoming > cfg.max_memory_bytes;
        if !items_full(self) && !bytes_full(self) {
            return;
        }
        self.purge_expired(now);

        if items_full(self) {
            let batch = ((cfg.max_items as f64 * cfg.eviction_ratio).ceil() as usize).max(1);
            let target = cfg.max_items.saturating_sub(batch);
            self.evict_lru_while(|s| s.entries.len() > target);
        }
        if bytes_full(self) {
            let slack = (cfg.max_memory_bytes as f64 * cfg.eviction_ratio) as usize;
            let target = cfg
                .max_memory_bytes
                .saturating_sub(slack)
                .saturating_sub(incoming);
            self.evict_lru_while(|s| s.memory_bytes > target);
        }
        debug!(
            items = self.entries.len(),
            bytes = self.memory_bytes,
            evictions = self.evictions,
            "memory cache evicted entries"
        );
    }
}

/// In-process LRU cache bounded by entry count and approximate memory.
///
/// Entry size is the length of the serialized value plus the key.
pub struct MemoryCacheStore {
    config: MemoryCacheConfig,
    state: Arc<Mutex<State>>,
    closed: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl MemoryCacheStore {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let state = Arc::new(Mutex::new(State {
            entries: LruCache::unbounded(),
            memory_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }));

        let weak = Arc::downgrade(&state);
        let sweeper = Sweeper::spawn(STORE, config.cleanup_interval, move || {
            let state = weak.upgrade()?;
            Some(async move { Ok(lock(&state).purge_expired(now_ms())) })
        });

        Self {
            config,
            state,
            closed: AtomicBool::new(false),
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

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let now = now_ms();
        let mut state = lock(&self.state);
        let expired = match state.entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => {
                let value = entry.value.clone();
                state.hits += 1;
                return Ok(Some(value));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove(key);
        }
        state.misses += 1;
        Ok(None)
    }

    async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        let size = serde_json::to_vec(value)?.len() + key.len();
        if size > self.config.max_memory_bytes {
            return Err(Error::ItemTooLarge {
                size,
                limit: self.config.max_memory_bytes,
            });
        }
        let now = now_ms();
        let mut state = lock(&self.state);
        state.remove(key);
        state.make_room(&self.config, size, now);
        state.memory_bytes += size;
        state.entries.put(
            key.to_string(),
            Entry {
                value: value.clone(),
                size,
                expires_at_ms: now.saturating_add(duration_ms(ttl)),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        lock(&self.state).remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        state.entries.clear();
        state.memory_bytes = 0;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.ensure_open()?;
        let state = lock(&self.state);
        Ok(CacheStats {
            items: state.entries.len() as u64,
            memory_bytes: state.memory_bytes as u64,
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        })
    }

    async fn cleanup(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(lock(&self.state).purge_expired(now_ms()))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        lock(&self.sweeper).take();
        let mut state = lock(&self.state);
        state.entries.clear();
        state.memory_bytes = 0;
        Ok(())
    }

    fn name(&self) -> &'static str {
        STORE
    }
}
