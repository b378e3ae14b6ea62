//! Bounded map with per-entry expiry.
//!
//! When an insert would exceed capacity, the `trim` oldest entries are dropped
//! first. Expired entries are treated as absent and removed on lookup.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Slot<V> {
    value: V,
    inserted_at: Instant,
}

pub struct ExpiringCache<K, V> {
    entries: Mutex<HashMap<K, Slot<V>>>,
    capacity: usize,
    trim: usize,
    /// `None` = entries never expire
    ttl: Option<Duration>,
}

impl<K: Eq + Hash + Clone, V: Clone> ExpiringCache<K, V> {
    pub fn new(capacity: usize, trim: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            trim: trim.clamp(1, capacity.max(1)),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(slot) if !self.is_expired(slot) => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            self.trim_oldest(&mut entries);
        }
        entries.insert(
            key,
            Slot {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &K) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, slot: &Slot<V>) -> bool {
        self.ttl
            .is_some_and(|ttl| slot.inserted_at.elapsed() >= ttl)
    }

    fn trim_oldest(&self, entries: &mut HashMap<K, Slot<V>>) {
        entries.retain(|_, slot| !self.is_expired(slot));
        if entries.len() < self.capacity {
            return;
        }
        let mut by_age: Vec<(K, Instant)> = entries
            .iter()
            .map(|(k, slot)| (k.clone(), slot.inserted_at))
            .collect();
        by_age.sort_by_key(|(_, inserted_at)| *inserted_at);
        for (key, _) in by_age.into_iter().take(self.trim) {
            entries.remove(&key);
        }
        tracing::debug!(remaining = entries.len(), "trimmed expiring cache");
    }
}
