use crate::rate_limit::RequestLog;
use crate::stores::{lock, Priority};
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct Entry {
    at_ms: i64,
    priority: Option<Priority>,
}

/// Per-resource deques of request timestamps, kept in arrival order.
#[derive(Default)]
pub struct MemoryRequestLog {
    entries: Mutex<HashMap<String, VecDeque<Entry>>>,
}

impl MemoryRequestLog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn drop_before(queue: &mut VecDeque<Entry>, before_ms: i64) -> u64 {
    let mut removed = 0;
    while queue.front().is_some_and(|e| e.at_ms <= before_ms) {
        queue.pop_front();
        removed += 1;
    }
    removed
}

#[async_trait]
impl RequestLog for MemoryRequestLog {
    async fn append(&self, resource: &str, priority: Option<Priority>, at_ms: i64) -> Result<()> {
        let mut entries = lock(&self.entries);
        let queue = entries.entry(resource.to_string()).or_default();
        let entry = Entry { at_ms, priority };
        // Clock skew between callers can deliver a slightly older timestamp.
        match queue.back() {
            Some(last) if last.at_ms > at_ms => {
                let pos = queue.partition_point(|e| e.at_ms <= at_ms);
                queue.insert(pos, entry);
            }
            _ => queue.push_back(entry),
        }
        Ok(())
    }

    async fn timestamps(
        &self,
        resource: &str,
        priority: Option<Priority>,
        since_ms: i64,
    ) -> Result<Vec<i64>> {
        let entries = lock(&self.entries);
        Ok(entries
            .get(resource)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|e| e.at_ms > since_ms)
                    .filter(|e| priority.is_none() || e.priority == priority)
                    .map(|e| e.at_ms)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn last_seen(&self, resource: &str, priority: Priority) -> Result<Option<i64>> {
        let entries = lock(&self.entries);
        Ok(entries.get(resource).and_then(|queue| {
            queue
                .iter()
                .rev()
                .find(|e| e.priority == Some(priority))
                .map(|e| e.at_ms)
        }))
    }

    async fn clear(&self, resource: &str) -> Result<()> {
        lock(&self.entries).remove(resource);
        Ok(())
    }

    async fn prune_resource(&self, resource: &str, before_ms: i64) -> Result<u64> {
        let mut entries = lock(&self.entries);
        let Some(queue) = entries.get_mut(resource) else {
            return Ok(0);
        };
        let removed = drop_before(queue, before_ms);
        if queue.is_empty() {
            entries.remove(resource);
        }
        Ok(removed)
    }

    async fn prune(&self, before_ms: i64) -> Result<u64> {
        let mut entries = lock(&self.entries);
        let mut removed = 0;
        entries.retain(|_, queue| {
            removed += drop_before(queue, before_ms);
            !queue.is_empty()
        });
        Ok(removed)
    }

    async fn close(&self) -> Result<()> {
        lock(&self.entries).clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory_rate_limit"
    }
}
