//! Listener registry.
//!
//! Maps event names to ordered listener lists. The empty name is the
//! wildcard bucket. Each bucket is an immutable snapshot replaced on every
//! mutation, so dispatch iterates a stable list while listeners are added or
//! removed concurrently: a listener present for the whole dispatch is called
//! exactly once, and no one is blocked while listeners run.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::listener::{same_listener, ListenerRef};

/// Name of the wildcard bucket
pub const WILDCARD: &str = "";

type Bucket = Arc<Vec<ListenerRef>>;

/// Thread-safe map from event name to listeners
#[derive(Default)]
pub struct ListenerRegistry {
    index: RwLock<HashMap<String, Bucket>>,
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener to the bucket of `event`; a listener already
    /// registered there keeps its position
    pub fn add(&self, event: &str, listener: ListenerRef) {
        let mut index = self.index.write();
        let bucket = index.entry(event.to_string()).or_default();
        if bucket.iter().any(|l| same_listener(l, &listener)) {
            return;
        }
        let mut next = Vec::with_capacity(bucket.len() + 1);
        next.extend(bucket.iter().cloned());
        next.push(listener);
        *bucket = Arc::new(next);
    }

    /// Snapshot of the listeners registered for `event`
    pub fn listeners(&self, event: &str) -> Bucket {
        self.index
            .read()
            .get(event)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the whole bucket of `event`
    pub fn remove_event(&self, event: &str) {
        self.index.write().remove(event);
    }

    /// Remove `listener` from every bucket
    pub fn remove_listener(&self, listener: &ListenerRef) {
        let mut index = self.index.write();
        for bucket in index.values_mut() {
            if bucket.iter().any(|l| same_listener(l, listener)) {
                *bucket = Arc::new(
                    bucket
                        .iter()
                        .filter(|l| !same_listener(l, listener))
                        .cloned()
                        .collect(),
                );
            }
        }
    }

    /// Remove `listener` from the bucket of `event` only
    pub fn remove(&self, event: &str, listener: &ListenerRef) {
        let mut index = self.index.write();
        if let Some(bucket) = index.get_mut(event) {
            *bucket = Arc::new(
                bucket
                    .iter()
                    .filter(|l| !same_listener(l, listener))
                    .cloned()
                    .collect(),
            );
        }
    }

    /// Total number of registrations across all buckets
    pub fn len(&self) -> usize {
        self.index.read().values().map(|b| b.len()).sum()
    }

    /// Whether no listener is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.read();
        let mut map = f.debug_map();
        for (event, bucket) in index.iter() {
            map.entry(event, &bucket.len());
        }
        map.finish()
    }
}
