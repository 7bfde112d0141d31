//! Durable FIFO queue of writes made while offline.
//!
//! The whole queue lives under one storage key, so every mutation is a single
//! `set_item` of the full list. Replay is strictly sequential: an item is only
//! removed after the remote system accepted it, and the first transient
//! failure stops the drain so later writes never overtake earlier ones.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::ReplayError;
use crate::storage::KeyValueStore;

/// Storage key holding the serialized queue.
pub const QUEUE_KEY: &str = "pending_writes";

/// Storage key receiving a queue list that could not be parsed at all.
const CORRUPT_QUEUE_KEY: &str = "pending_writes:corrupt";

/// An application-defined operation tag, usually a fieldless enum.
pub trait WriteKind:
  Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> WriteKind for T where
  T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// Dispatch table from a queued operation to the network call that replays it.
///
/// Implement this with an exhaustive `match` over the application's kind enum
/// so that adding a kind without a replay path fails to compile.
pub trait Replayer<K>: Send + Sync {
  fn replay<'a>(&'a self, kind: &'a K, payload: &'a Value)
    -> BoxFuture<'a, Result<Value, ReplayError>>;
}

/// Identifier of a queued write, ordered by creation.
///
/// `seq` breaks ties between writes created within the same millisecond and
/// keeps ids increasing if the wall clock steps backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct WriteId {
  pub millis: i64,
  pub seq: u32,
}

impl WriteId {
  /// The smallest id strictly greater than `last` at time `now_millis`.
  fn next_after(last: Option<WriteId>, now_millis: i64) -> Self {
    match last {
      Some(last) if now_millis <= last.millis => WriteId {
        millis: last.millis,
        seq: last.seq + 1,
      },
      _ => WriteId {
        millis: now_millis,
        seq: 0,
      },
    }
  }
}

impl fmt::Display for WriteId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}", self.millis, self.seq)
  }
}

impl FromStr for WriteId {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    let (millis, seq) = s
      .split_once('-')
      .ok_or_else(|| eyre!("Invalid write id '{}': expected <millis>-<seq>", s))?;
    Ok(WriteId {
      millis: millis
        .parse()
        .map_err(|e| eyre!("Invalid write id '{}': {}", s, e))?,
      seq: seq
        .parse()
        .map_err(|e| eyre!("Invalid write id '{}': {}", s, e))?,
    })
  }
}

impl From<WriteId> for String {
  fn from(id: WriteId) -> Self {
    id.to_string()
  }
}

impl TryFrom<String> for WriteId {
  type Error = color_eyre::Report;

  fn try_from(s: String) -> Result<Self> {
    s.parse()
  }
}

/// A write intent waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWriteItem<K> {
  pub id: WriteId,
  pub kind: K,
  pub payload: Value,
}

/// Outcome of one drain run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Replayed and removed, in replay order
  pub succeeded: Vec<WriteId>,
  /// The item that failed transiently and blocked the rest (at most one)
  pub failed: Vec<WriteId>,
  /// Permanently rejected by the remote system and removed
  pub discarded: Vec<WriteId>,
  /// Reason the blocking item failed
  pub failure_reason: Option<String>,
}

impl DrainReport {
  /// True when nothing was left behind because of a failure.
  pub fn is_clean(&self) -> bool {
    self.failed.is_empty()
  }

  pub fn is_empty(&self) -> bool {
    self.succeeded.is_empty() && self.failed.is_empty() && self.discarded.is_empty()
  }
}

struct QueueState<K> {
  items: Vec<PendingWriteItem<K>>,
  /// Stored entries this build cannot decode. Kept verbatim, never replayed.
  undecodable: Vec<Value>,
  last_id: Option<WriteId>,
}

/// Durable list of pending writes.
pub struct PendingWriteQueue<K> {
  store: Arc<dyn KeyValueStore>,
  clock: Arc<dyn Clock>,
  state: Mutex<QueueState<K>>,
}

impl<K: WriteKind> PendingWriteQueue<K> {
  /// Open the queue, restoring whatever a previous process left behind.
  pub async fn open(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Result<Self> {
    let raw = store
      .get_item(QUEUE_KEY)
      .await
      .map_err(|e| eyre!("Failed to load pending writes: {}", e))?;

    let entries: Vec<Value> = match raw {
      None => Vec::new(),
      Some(raw) => match serde_json::from_str(&raw) {
        Ok(entries) => entries,
        Err(e) => {
          error!(error = %e, "pending write list is unreadable, setting it aside");
          store
            .set_item(CORRUPT_QUEUE_KEY, raw)
            .await
            .map_err(|e| eyre!("Failed to preserve unreadable pending writes: {}", e))?;
          Vec::new()
        }
      },
    };

    let mut items = Vec::with_capacity(entries.len());
    let mut undecodable = Vec::new();
    let mut last_id: Option<WriteId> = None;

    for entry in entries {
      match serde_json::from_value::<PendingWriteItem<K>>(entry.clone()) {
        Ok(item) => {
          last_id = last_id.max(Some(item.id));
          items.push(item);
        }
        Err(e) => {
          warn!(error = %e, entry = %entry, "keeping undecodable pending write");
          let id = entry
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<WriteId>().ok());
          last_id = last_id.max(id);
          undecodable.push(entry);
        }
      }
    }

    items.sort_by_key(|item| item.id);
    if !items.is_empty() {
      info!(count = items.len(), "restored pending writes");
    }

    Ok(Self {
      store,
      clock,
      state: Mutex::new(QueueState {
        items,
        undecodable,
        last_id,
      }),
    })
  }

  /// Append a write and persist the list.
  ///
  /// Never fails: if storage rejects the rewrite the item is still held in
  /// memory and goes to disk with the next successful rewrite.
  pub async fn enqueue(&self, kind: K, payload: Value) -> WriteId {
    let mut state = self.state.lock().await;

    let id = WriteId::next_after(state.last_id, self.clock.now_millis());
    state.last_id = Some(id);
    debug!(%id, ?kind, "enqueue pending write");
    state.items.push(PendingWriteItem { id, kind, payload });

    if let Err(e) = self.persist(&state).await {
      error!(%id, error = %e, "pending write held in memory only");
    }
    id
  }

  /// Snapshot of the queue in replay order.
  pub async fn list(&self) -> Vec<PendingWriteItem<K>> {
    self.state.lock().await.items.clone()
  }

  pub async fn len(&self) -> usize {
    self.state.lock().await.items.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Number of stored entries that could not be decoded as `K`.
  pub async fn undecodable_count(&self) -> usize {
    self.state.lock().await.undecodable.len()
  }

  /// Remove one item by hand. Returns whether it existed.
  pub async fn remove_by_id(&self, id: WriteId) -> Result<bool> {
    let mut state = self.state.lock().await;

    let Some(pos) = state.items.iter().position(|item| item.id == id) else {
      return Ok(false);
    };
    let removed = state.items.remove(pos);

    if let Err(e) = self.persist(&state).await {
      state.items.insert(pos, removed);
      return Err(e);
    }
    info!(%id, "pending write removed");
    Ok(true)
  }

  /// Replay queued writes oldest first, one at a time.
  ///
  /// Only items present when the drain starts are considered; writes enqueued
  /// meanwhile wait for the next drain and items removed meanwhile are
  /// skipped. The list lock is not held while a
  /// replay is in flight.
  pub async fn drain(&self, replayer: &dyn Replayer<K>) -> DrainReport {
    let snapshot = self.list().await;
    let mut report = DrainReport::default();

    for item in snapshot {
      if !self.contains(item.id).await {
        debug!(id = %item.id, "pending write removed during drain, skipping");
        continue;
      }

      match replayer.replay(&item.kind, &item.payload).await {
        Ok(_) => {
          debug!(id = %item.id, kind = ?item.kind, "replayed pending write");
          self.remove_replayed(item.id).await;
          report.succeeded.push(item.id);
        }
        Err(ReplayError::Rejected(reason)) => {
          warn!(id = %item.id, kind = ?item.kind, %reason, "pending write rejected, discarding");
          self.remove_replayed(item.id).await;
          report.discarded.push(item.id);
        }
        Err(ReplayError::Transient(reason)) => {
          warn!(id = %item.id, kind = ?item.kind, %reason, "replay failed, stopping drain");
          report.failed.push(item.id);
          report.failure_reason = Some(reason);
          break;
        }
      }
    }

    if !report.is_empty() {
      info!(
        succeeded = report.succeeded.len(),
        failed = report.failed.len(),
        discarded = report.discarded.len(),
        "drain finished"
      );
    }
    report
  }

  async fn contains(&self, id: WriteId) -> bool {
    self.state.lock().await.items.iter().any(|item| item.id == id)
  }

  /// Drop an item the remote side has already seen. A failed rewrite is only
  /// logged: keeping it in memory would replay it again in this process.
  async fn remove_replayed(&self, id: WriteId) {
    let mut state = self.state.lock().await;
    state.items.retain(|item| item.id != id);
    if let Err(e) = self.persist(&state).await {
      error!(%id, error = %e, "failed to persist removal of replayed write");
    }
  }

  async fn persist(&self, state: &QueueState<K>) -> Result<()> {
    let mut entries = state
      .items
      .iter()
      .map(serde_json::to_value)
      .collect::<serde_json::Result<Vec<Value>>>()
      .map_err(|e| eyre!("Failed to serialize pending writes: {}", e))?;
    entries.extend(state.undecodable.iter().cloned());

    let encoded = serde_json::to_string(&entries)
      .map_err(|e| eyre!("Failed to serialize pending writes: {}", e))?;
    self.store.set_item(QUEUE_KEY, encoded).await
  }
}
