//! The persistence contract consumed by the cache, queue and telemetry layers.

use color_eyre::Result;
use futures::future::BoxFuture;

/// Asynchronous string key/value store, durable across restarts.
///
/// Implementations need not be transactional across keys. Callers that need an
/// atomic rewrite of a collection store the whole collection under one key.
pub trait KeyValueStore: Send + Sync {
  /// Read the value stored under `key`, or `None` if absent.
  fn get_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

  /// Insert or overwrite the value under `key`.
  fn set_item<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>>;

  /// Delete `key`. Removing a missing key is not an error.
  fn remove_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;

  /// List every key currently stored.
  fn get_all_keys(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}
