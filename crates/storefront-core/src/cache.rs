//! Query result cache driven by invalidation events.
//!
//! Push events, polling ticks and user actions all funnel into
//! [`InvalidationSink::invalidate`]. A key reports `Stale` on its
//! clean-to-dirty transition. Signals that land while the key is already
//! dirty collapse into a single follow-up: the next [`QueryCache::store`] or
//! [`QueryCache::mark_fresh`] keeps the key dirty and reports `Stale` again,
//! since the refetch in flight may predate the change.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde_json::Value;
use tracing::{debug, trace};

use crate::{
    channel::{EventBus, EventStream},
    types::InvalidationEvent,
};

/// Consumer of invalidation events.
pub trait InvalidationSink: Send + Sync {
    fn invalidate(&self, event: InvalidationEvent);
}

/// Notification that a cached query needs a refetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Stale { key: String, resource_tag: String },
}

#[derive(Debug, Default)]
struct CacheEntry {
    value: Option<Value>,
    dirty: bool,
    /// Tag of an invalidation received while already dirty.
    follow_up: Option<String>,
}

#[derive(Debug, Default)]
struct CacheState {
    keys_by_tag: HashMap<String, BTreeSet<String>>,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug)]
pub struct QueryCache {
    state: Mutex<CacheState>,
    events: EventBus<CacheEvent>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(256)
    }
}

impl QueryCache {
    pub fn new(event_buffer: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            events: EventBus::new(event_buffer),
        }
    }

    pub fn subscribe(&self) -> EventStream<CacheEvent> {
        self.events.subscribe()
    }

    /// Register a query key under the resource tags it depends on.
    pub fn register(&self, key: &str, resource_tags: &[&str]) {
        let mut state = self.lock();
        state.entries.entry(key.to_owned()).or_default();
        for tag in resource_tags {
            state
                .keys_by_tag
                .entry((*tag).to_owned())
                .or_default()
                .insert(key.to_owned());
        }
    }

    /// Store a fetched result. The key turns fresh unless it was invalidated
    /// again meanwhile.
    pub fn store(&self, key: &str, value: Value) {
        let follow_up = {
            let mut state = self.lock();
            let entry = state.entries.entry(key.to_owned()).or_default();
            entry.value = Some(value);
            settle(entry)
        };
        self.emit_follow_up(key, follow_up);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock()
            .entries
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.lock().entries.get(key).is_some_and(|entry| entry.dirty)
    }

    /// Re-arm a key after a refetch that did not produce a new value.
    pub fn mark_fresh(&self, key: &str) {
        let follow_up = self.lock().entries.get_mut(key).and_then(settle);
        self.emit_follow_up(key, follow_up);
    }

    /// Dirty keys in stable order.
    pub fn stale_keys(&self) -> Vec<String> {
        let state = self.lock();
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop a key and its tag links.
    pub fn forget(&self, key: &str) {
        let mut state = self.lock();
        state.entries.remove(key);
        for keys in state.keys_by_tag.values_mut() {
            keys.remove(key);
        }
        state.keys_by_tag.retain(|_, keys| !keys.is_empty());
    }

    /// Mark every key under `resource_tag` dirty. Returns how many keys
    /// transitioned from clean to dirty.
    pub fn invalidate_tag(&self, resource_tag: &str) -> usize {
        let newly_stale = {
            let mut state = self.lock();
            let Some(keys) = state.keys_by_tag.get(resource_tag).cloned() else {
                trace!(resource_tag, "invalidation for unknown tag ignored");
                return 0;
            };

            let mut newly_stale = Vec::new();
            for key in keys {
                let Some(entry) = state.entries.get_mut(&key) else {
                    continue;
                };
                if entry.dirty {
                    entry.follow_up = Some(resource_tag.to_owned());
                } else {
                    entry.dirty = true;
                    newly_stale.push(key);
                }
            }
            newly_stale
        };

        if !newly_stale.is_empty() {
            debug!(resource_tag, keys = newly_stale.len(), "cache keys marked stale");
        }
        for key in &newly_stale {
            self.events.emit(CacheEvent::Stale {
                key: key.clone(),
                resource_tag: resource_tag.to_owned(),
            });
        }
        newly_stale.len()
    }

    fn emit_follow_up(&self, key: &str, follow_up: Option<String>) {
        if let Some(resource_tag) = follow_up {
            debug!(key, resource_tag = %resource_tag, "invalidated during refetch; still stale");
            self.events.emit(CacheEvent::Stale {
                key: key.to_owned(),
                resource_tag,
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Finish a refetch cycle. Returns the pending follow-up tag, in which case
/// the entry stays dirty.
fn settle(entry: &mut CacheEntry) -> Option<String> {
    let follow_up = entry.follow_up.take();
    entry.dirty = follow_up.is_some();
    follow_up
}

impl InvalidationSink for QueryCache {
    fn invalidate(&self, event: InvalidationEvent) {
        self.invalidate_tag(&event.resource_tag);
    }
}
