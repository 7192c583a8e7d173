//! Key-value stores backing the content cache and idempotency records.
//!
//! The pipeline never assumes it is the only writer. Besides plain
//! `get`/`set`/`delete`, every backend offers [`KeyValueStore::set_if_absent`],
//! an atomic conditional write used to claim idempotency keys, plus
//! owner-checked renew and delete for those claims.
//!
//! Values written with `set_if_absent` are records other callers depend on.
//! [`MemoryStore`] never evicts them before they expire; when only such
//! records remain at capacity, writes fail with [`StoreError::CapacityExceeded`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Error types for store operations
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Connection error
    #[error("Store connection error: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// Operation timeout
    #[error("Store operation timeout after {0:?}")]
    Timeout(Duration),

    /// Backend not available
    #[error("Store backend not available: {0}")]
    Unavailable(String),

    /// Every entry is a live record that may not be evicted
    #[error("Store full: {0} live records")]
    CapacityExceeded(usize),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store backend trait
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a value; expired entries read as absent
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Set a value, with an optional TTL
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()>;

    /// Atomically set a value only if the key is absent (or expired).
    ///
    /// Returns `true` when this call wrote the value.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Delete a key
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Atomically delete `key` only while it holds `expected`.
    ///
    /// Returns `true` when this call removed the value.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Atomically reset the TTL of `key` only while it holds `expected`.
    ///
    /// Returns `false` when the key is absent, expired or holds another value.
    async fn renew_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Check if the backend is reachable
    async fn health_check(&self) -> StoreResult<()>;

    /// Backend name for logs and metrics
    fn name(&self) -> &'static str;
}

/// Read and decode a JSON value
///
/// # Errors
/// Returns a store error, or [`StoreError::Serialization`] when the stored
/// bytes do not decode as `T`
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string())),
        None => Ok(None),
    }
}

/// Encode and write a JSON value
///
/// # Errors
/// Returns a store error, or [`StoreError::Serialization`] when `value`
/// cannot be encoded
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<()> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(key, bytes, ttl).await
}

/// Encode and write a JSON value only if `key` is absent
///
/// Returns `true` when this call wrote the value.
///
/// # Errors
/// Returns a store error, or [`StoreError::Serialization`] when `value`
/// cannot be encoded
pub async fn set_json_if_absent<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> StoreResult<bool> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set_if_absent(key, bytes, ttl).await
}

#[derive(Debug)]
struct Entry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    hits: u64,
    // Written by `set_if_absent`; never evicted while live
    pinned: bool,
}

impl Entry {
    fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            hits: 0,
            pinned: false,
        }
    }

    fn pinned(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            pinned: true,
            ..Self::new(data, ttl)
        }
    }

    fn holds(&self, expected: &[u8]) -> bool {
        !self.is_expired() && self.data == expected
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

/// In-memory store for single-instance deployments and tests
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    max_entries: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` keys
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
        }
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.is_expired()).count()
    }

    /// Whether no live entries remain
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make room for one more entry
    fn evict_if_needed(&self, entries: &mut HashMap<String, Entry>) -> StoreResult<()> {
        entries.retain(|_, entry| !entry.is_expired());
        if entries.len() < self.max_entries {
            return Ok(());
        }

        // Still at capacity: drop the least-read unpinned entries
        let to_remove = entries.len() - self.max_entries + 1;
        let mut hit_counts: Vec<(String, u64)> = entries
            .iter()
            .filter(|(_, v)| !v.pinned)
            .map(|(k, v)| (k.clone(), v.hits))
            .collect();
        if hit_counts.len() < to_remove {
            return Err(StoreError::CapacityExceeded(entries.len()));
        }
        hit_counts.sort_by_key(|(_, hits)| *hits);

        for (key, _) in hit_counts.into_iter().take(to_remove) {
            entries.remove(&key);
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired() {
                entries.remove(key);
                return Ok(None);
            }
            entry.hits += 1;
            return Ok(Some(entry.data.clone()));
        }

        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) {
            self.evict_if_needed(&mut entries)?;
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        // Check and insert under one write guard
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| !entry.is_expired()) {
            return Ok(false);
        }
        if entries.remove(key).is_none() {
            self.evict_if_needed(&mut entries)?;
        }
        entries.insert(key.to_string(), Entry::pinned(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.holds(expected)) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn renew_if_equals(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if entry.holds(expected) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
