use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Fixed-capacity LRU map whose entries also expire after `ttl`. Time is passed in by the
/// caller so eviction is deterministic.
#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    capacity: usize,
    ttl: Duration,
    tick: u64,
    entries: HashMap<String, Entry<V>>,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    stored_at: DateTime<Utc>,
    last_used: u64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            tick: 0,
            entries: HashMap::new(),
        }
    }

    pub fn get(&mut self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let expired = match self.entries.get(key) {
            None => return None,
            Some(entry) => now - entry.stored_at >= self.ttl,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(key).map(|entry| {
            entry.last_used = tick;
            entry.value.clone()
        })
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V, now: DateTime<Utc>) {
        let key = key.into();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_one(now);
        }
        self.tick += 1;
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: now,
                last_used: self.tick,
            },
        );
    }

    pub fn invalidate(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // Expired entries go first; otherwise the least recently used one.
    fn evict_one(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        let victim = self
            .entries
            .iter()
            .find(|(_, e)| now - e.stored_at >= ttl)
            .or_else(|| self.entries.iter().min_by_key(|(_, e)| e.last_used))
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
        }
    }
}
