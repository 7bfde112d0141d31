//! SQLite implementation of the key/value store.

use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture, FutureExt};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::KeyValueStore;

/// Schema for the key/value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed [`KeyValueStore`].
///
/// Each `set_item` is a single `INSERT OR REPLACE`, so a value written under
/// one key is either fully there or not at all after a crash.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-sync").join("store.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute_batch(KV_SCHEMA)
        .map_err(|e| eyre!("Failed to run store migrations: {}", e))
    })
  }

  fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&conn)
  }

  fn get_sync(&self, key: &str) -> Result<Option<String>> {
    self.with_conn(|conn| {
      conn
        .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
          row.get(0)
        })
        .optional()
        .map_err(|e| eyre!("Failed to read key {}: {}", key, e))
    })
  }

  fn set_sync(&self, key: &str, value: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
          params![key, value],
        )
        .map_err(|e| eyre!("Failed to write key {}: {}", key, e))?;
      Ok(())
    })
  }

  fn remove_sync(&self, key: &str) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute("DELETE FROM kv WHERE key = ?", params![key])
        .map_err(|e| eyre!("Failed to remove key {}: {}", key, e))?;
      Ok(())
    })
  }

  fn keys_sync(&self) -> Result<Vec<String>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare("SELECT key FROM kv ORDER BY key")
        .map_err(|e| eyre!("Failed to prepare key listing: {}", e))?;

      let keys = stmt
        .query_map([], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list keys: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read key: {}", e))?;

      Ok(keys)
    })
  }
}

impl KeyValueStore for SqliteStore {
  fn get_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
    future::ready(self.get_sync(key)).boxed()
  }

  fn set_item<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
    future::ready(self.set_sync(key, &value)).boxed()
  }

  fn remove_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
    future::ready(self.remove_sync(key)).boxed()
  }

  fn get_all_keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
    future::ready(self.keys_sync()).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_roundtrip_in_memory() {
    let store = SqliteStore::open_in_memory().unwrap();

    store.set_item("b", "two".to_string()).await.unwrap();
    store.set_item("a", "one".to_string()).await.unwrap();
    store.set_item("a", "uno".to_string()).await.unwrap();

    assert_eq!(store.get_item("a").await.unwrap().as_deref(), Some("uno"));
    assert_eq!(store.get_all_keys().await.unwrap(), vec!["a", "b"]);

    store.remove_item("a").await.unwrap();
    assert_eq!(store.get_item("a").await.unwrap(), None);
    assert_eq!(store.get_all_keys().await.unwrap(), vec!["b"]);
  }

  #[tokio::test]
  async fn test_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("offline-sync-sqlite-{}", std::process::id()));
    let path = dir.join("store.db");
    let _ = std::fs::remove_dir_all(&dir);

    {
      let store = SqliteStore::open(&path).unwrap();
      store.set_item("pending", "[1,2]".to_string()).await.unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get_item("pending").await.unwrap().as_deref(), Some("[1,2]"));

    let _ = std::fs::remove_dir_all(&dir);
  }
}
