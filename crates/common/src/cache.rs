//! TTL-expiring associative store
//!
//! The store knows nothing about paths or nodes; callers pick the keys. One
//! readers-writer lock guards the whole table, so lookups run concurrently
//! with each other but never alongside a write.
//!
//! There is no eviction besides TTL. A zero TTL means the entry lives until it
//! is deleted, overwritten or flushed. Expired entries are treated as absent on
//! read and dropped from the table on the next `purge_expired`.
//!
//! This is a plain locked map rather than a `moka` cache: `flush` has to drop
//! every entry atomically and `size` has to be exact, neither of which holds
//! for moka's deferred eviction.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

/// A cached value together with the instant it stops being served
#[derive(Debug, Clone)]
pub struct CachedItem<V> {
    /// `None` means the entry never expires
    pub expires_at: Option<Instant>,
    pub data: V,
}

impl<V> CachedItem<V> {
    fn new(data: V, ttl: Duration) -> Self {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        Self { expires_at, data }
    }

    /// Returns true once the entry's TTL has elapsed
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// Concurrent key → value store with per-entry expiry
#[derive(Debug)]
pub struct CacheStore<V> {
    items: RwLock<HashMap<String, CachedItem<V>>>,
}

impl<V> Default for CacheStore<V> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> CacheStore<V> {
    pub fn new() -> Self {
        tracing::debug!("creating a new cache store");
        Self::default()
    }

    /// Get the value stored under `key`, unless it is missing or expired
    pub fn get(&self, key: &str) -> Option<V> {
        let items = self.items.read();
        tracing::trace!(key, "cache get");
        items
            .get(key)
            .filter(|item| !item.is_expired())
            .map(|item| item.data.clone())
    }

    /// Store `value` under `key`, replacing any prior entry and its expiry
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        tracing::trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set");
        self.items.write().insert(key, CachedItem::new(value, ttl));
    }

    /// Check whether a live entry exists for `key`
    pub fn exists(&self, key: &str) -> bool {
        self.items
            .read()
            .get(key)
            .is_some_and(|item| !item.is_expired())
    }

    /// Remove the entry for `key`, returning whether one was present
    pub fn delete(&self, key: &str) -> bool {
        tracing::trace!(key, "cache delete");
        self.items.write().remove(key).is_some()
    }

    /// Number of entries in the table, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Discard every entry
    pub fn flush(&self) {
        let mut items = self.items.write();
        tracing::debug!(entries = items.len(), "flushing cache");
        items.clear();
    }

    /// Drop expired entries from the table, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let mut items = self.items.write();
        let before = items.len();
        items.retain(|_, item| !item.is_expired());
        before - items.len()
    }
}
