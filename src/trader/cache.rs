//! Bounded, aged, insertion-ordered caches for the settlement driver.
//!
//! Dedupe sets and retry maps must never grow without bound: entries are
//! evicted oldest-first past a capacity cap and dropped past an age
//! cutoff on every prune.

use std::collections::{HashMap, VecDeque};

/// Insertion-ordered map with capacity and age eviction.
#[derive(Debug)]
pub struct AgedMap<V> {
    entries: HashMap<String, (V, u64)>,
    order: VecDeque<(String, u64)>,
    cap: usize,
}

impl<V> AgedMap<V> {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V, now_ms: u64) {
        let key = key.into();
        self.entries.insert(key.clone(), (value, now_ms));
        self.order.push_back((key, now_ms));
        self.evict_over_cap();
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|(value, _)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(value, _)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Drops every entry older than `max_age_ms`.
    pub fn prune(&mut self, now_ms: u64, max_age_ms: u64) {
        let cutoff = now_ms.saturating_sub(max_age_ms);
        while let Some((key, inserted)) = self.order.front() {
            if *inserted >= cutoff {
                break;
            }
            let (key, inserted) = (key.clone(), *inserted);
            self.order.pop_front();
            // A later re-insert supersedes this order entry.
            if let Some((_, current)) = self.entries.get(&key)
                && *current == inserted
            {
                self.entries.remove(&key);
            }
        }
    }

    fn evict_over_cap(&mut self) {
        while self.entries.len() > self.cap {
            let Some((key, inserted)) = self.order.pop_front() else {
                break;
            };
            if let Some((_, current)) = self.entries.get(&key)
                && *current == inserted
            {
                self.entries.remove(&key);
            }
        }
    }
}

/// Set flavor of [`AgedMap`], used for envelope-signature dedupe.
#[derive(Debug)]
pub struct AgedSet {
    inner: AgedMap<()>,
}

impl AgedSet {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: AgedMap::new(cap),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, now_ms: u64) {
        self.inner.insert(key, (), now_ms);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    pub fn remove(&mut self, key: &str) {
        self.inner.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn prune(&mut self, now_ms: u64, max_age_ms: u64) {
        self.inner.prune(now_ms, max_age_ms);
    }
}
