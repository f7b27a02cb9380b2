//! In-memory key/value store with a per-entry lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A cached value together with its lifetime bounds.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub key: String,
  pub value: V,
  pub created_at: Instant,
  pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
  fn is_expired(&self, now: Instant) -> bool {
    now >= self.expires_at
  }
}

/// Time-to-live cache.
///
/// The cache knows nothing about endpoints: the caller picks the TTL on every
/// `set`. Expired entries are never returned; `get` evicts them as it finds them,
/// and `sweep_expired` exists only to bound memory for keys nobody reads again.
pub struct TtlCache<V> {
  entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
    }
  }

  // The map is always left consistent, so a poisoned lock is still usable.
  fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Get a live value, evicting the entry if it has expired.
  pub fn get(&self, key: &str) -> Option<V> {
    self.get_entry(key).map(|entry| entry.value)
  }

  /// Like `get`, but returns the whole entry including its timestamps.
  pub fn get_entry(&self, key: &str) -> Option<CacheEntry<V>> {
    let now = Instant::now();
    let mut entries = self.lock();
    match entries.get(key) {
      Some(entry) if entry.is_expired(now) => {
        entries.remove(key);
        None
      }
      Some(entry) => Some(entry.clone()),
      None => None,
    }
  }

  /// Store a value, replacing whatever was there.
  pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
    let key = key.into();
    let now = Instant::now();
    let entry = CacheEntry {
      key: key.clone(),
      value,
      created_at: now,
      expires_at: now + ttl,
    };
    self.lock().insert(key, entry);
  }

  /// Remove one entry. Returns whether anything was removed.
  pub fn delete(&self, key: &str) -> bool {
    self.lock().remove(key).is_some()
  }

  /// Drop every entry.
  pub fn clear(&self) {
    self.lock().clear();
  }

  /// Remove all expired entries and return how many were dropped.
  pub fn sweep_expired(&self) -> usize {
    let now = Instant::now();
    let mut entries = self.lock();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
  }

  /// Number of stored entries, expired or not.
  pub fn len(&self) -> usize {
    self.lock().len()
  }

  #[allow(dead_code)]
  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }
}

impl<V: Clone> Default for TtlCache<V> {
  fn default() -> Self {
    Self::new()
  }
}

impl<V: Clone + Send + 'static> TtlCache<V> {
  /// Run `sweep_expired` every `interval` until `cancel` fires.
  pub fn spawn_sweeper(
    self: &Arc<Self>,
    interval: Duration,
    cancel: CancellationToken,
  ) -> tokio::task::JoinHandle<()> {
    let cache = Arc::clone(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately.
      ticker.tick().await;
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => {
            let removed = cache.sweep_expired();
            if removed > 0 {
              debug!(removed, remaining = cache.len(), "Swept expired cache entries");
            }
          }
        }
      }
    })
  }
}
