//! Cache store with lazy expiry over a [`KeyValueStore`].

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::SyncError;
use crate::storage::KeyValueStore;

/// Cache settings fixed at construction.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  /// Prefix that scopes every cache key in the shared store
  pub namespace: String,
  /// How long an entry may be served after it was written
  pub ttl: Duration,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      namespace: "cache".to_string(),
      ttl: Duration::hours(24),
    }
  }
}

/// Options for a single cache lookup.
#[derive(Debug, Clone, Copy)]
pub struct GetOptions {
  /// Drop and hide entries older than the TTL. Only replay bookkeeping turns
  /// this off.
  pub check_expiry: bool,
}

impl Default for GetOptions {
  fn default() -> Self {
    Self { check_expiry: true }
  }
}

/// A decoded cache entry.
#[derive(Debug, Clone)]
pub struct CachedEntry<T> {
  pub value: T,
  pub stored_at: DateTime<Utc>,
}

/// On-disk record layout.
#[derive(Serialize)]
struct RecordRef<'a, T> {
  value: &'a T,
  stored_at: i64,
}

#[derive(Deserialize)]
struct Record {
  value: serde_json::Value,
  stored_at: i64,
}

/// TTL-bounded key/value cache.
///
/// Writes are best-effort: a failing backend is logged and never reported to
/// the caller. Reads that hit an expired or undecodable record delete it and
/// report a miss.
#[derive(Clone)]
pub struct CacheStore {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  config: CacheConfig,
}

impl CacheStore {
  pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
    Self {
      store,
      clock,
      config,
    }
  }

  pub fn ttl(&self) -> Duration {
    self.config.ttl
  }

  /// Key under which `key` is persisted.
  pub fn storage_key(&self, key: &str) -> String {
    format!("{}:{}", self.config.namespace, key)
  }

  fn prefix(&self) -> String {
    format!("{}:", self.config.namespace)
  }

  /// Store `value` under `key`, stamped with the current time.
  pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
    let record = RecordRef {
      value,
      stored_at: self.clock.now_millis(),
    };

    let encoded = match serde_json::to_string(&record) {
      Ok(encoded) => encoded,
      Err(e) => {
        warn!(key, error = %e, "cache put skipped: value is not serializable");
        return;
      }
    };

    match self.store.set_item(&self.storage_key(key), encoded).await {
      Ok(()) => debug!(key, "cache put"),
      Err(e) => warn!(key, error = %e, "cache put failed"),
    }
  }

  /// Look up a fresh value.
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_with(key, GetOptions::default()).await
  }

  pub async fn get_with<T: DeserializeOwned>(&self, key: &str, opts: GetOptions) -> Option<T> {
    self.get_entry(key, opts).await.map(|entry| entry.value)
  }

  /// Look up a value together with the time it was stored.
  pub async fn get_entry<T: DeserializeOwned>(
    &self,
    key: &str,
    opts: GetOptions,
  ) -> Option<CachedEntry<T>> {
    let storage_key = self.storage_key(key);

    let raw = match self.store.get_item(&storage_key).await {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    let record: Record = match serde_json::from_str(&raw) {
      Ok(record) => record,
      Err(e) => {
        self.discard_corrupt(key, &storage_key, e.to_string()).await;
        return None;
      }
    };

    let Some(stored_at) = DateTime::from_timestamp_millis(record.stored_at) else {
      self
        .discard_corrupt(key, &storage_key, format!("invalid timestamp {}", record.stored_at))
        .await;
      return None;
    };

    if opts.check_expiry && self.is_expired(record.stored_at) {
      debug!(key, "cache entry expired");
      if let Err(e) = self.store.remove_item(&storage_key).await {
        warn!(key, error = %e, "failed to remove expired cache entry");
      }
      return None;
    }

    match serde_json::from_value(record.value) {
      Ok(value) => Some(CachedEntry { value, stored_at }),
      Err(e) => {
        self.discard_corrupt(key, &storage_key, e.to_string()).await;
        None
      }
    }
  }

  /// Delete a single entry.
  pub async fn remove(&self, key: &str) {
    if let Err(e) = self.store.remove_item(&self.storage_key(key)).await {
      warn!(key, error = %e, "cache remove failed");
    }
  }

  /// Delete every entry in this cache's namespace. Returns how many were removed.
  pub async fn clear_all(&self) -> usize {
    let keys = match self.store.get_all_keys().await {
      Ok(keys) => keys,
      Err(e) => {
        warn!(error = %e, "cache clear failed to list keys");
        return 0;
      }
    };

    let prefix = self.prefix();
    let mut removed = 0;
    for key in keys.iter().filter(|k| k.starts_with(&prefix)) {
      match self.store.remove_item(key).await {
        Ok(()) => removed += 1,
        Err(e) => warn!(key = %key, error = %e, "cache clear failed to remove key"),
      }
    }

    debug!(removed, namespace = %self.config.namespace, "cache cleared");
    removed
  }

  fn is_expired(&self, stored_at_millis: i64) -> bool {
    self.clock.now_millis() - stored_at_millis > self.config.ttl.num_milliseconds()
  }

  async fn discard_corrupt(&self, key: &str, storage_key: &str, reason: String) {
    let err = SyncError::CorruptCacheEntry {
      key: key.to_string(),
      reason,
    };
    warn!(error = %err, "discarding cache entry");
    if let Err(e) = self.store.remove_item(storage_key).await {
      warn!(key, error = %e, "failed to remove corrupt cache entry");
    }
  }
}
