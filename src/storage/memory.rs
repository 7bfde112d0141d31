//! In-process store with no durability.

use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Mutex;

use super::traits::KeyValueStore;

/// `HashMap`-backed [`KeyValueStore`]. Contents are lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
  items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_items<R>(&self, f: impl FnOnce(&mut HashMap<String, String>) -> R) -> Result<R> {
    let mut items = self
      .items
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut items))
  }
}

impl KeyValueStore for MemoryStore {
  fn get_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
    future::ready(self.with_items(|items| items.get(key).cloned())).boxed()
  }

  fn set_item<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
    future::ready(self.with_items(|items| {
      items.insert(key.to_string(), value);
    }))
    .boxed()
  }

  fn remove_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
    future::ready(self.with_items(|items| {
      items.remove(key);
    }))
    .boxed()
  }

  fn get_all_keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
    future::ready(self.with_items(|items| items.keys().cloned().collect())).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_set_get_remove() {
    let store = MemoryStore::new();
    assert_eq!(store.get_item("a").await.unwrap(), None);

    store.set_item("a", "1".to_string()).await.unwrap();
    assert_eq!(store.get_item("a").await.unwrap().as_deref(), Some("1"));

    store.remove_item("a").await.unwrap();
    assert_eq!(store.get_item("a").await.unwrap(), None);
    // Removing again is fine
    store.remove_item("a").await.unwrap();
  }
}
