//! The coordinator callers talk to.
//!
//! Reads go network-first while connected and fall back to the cache; writes go
//! straight to the network while connected and into the pending write queue
//! otherwise (or when the send fails). Every DISCONNECTED -> CONNECTED edge
//! drains the queue in order.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheResult, CacheStore, GetOptions};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::SyncError;
use crate::network::{
  ConnectivityProbe, ConnectivityState, NetworkMonitor, Subscription, Transition,
};
use crate::queue::{DrainReport, PendingWriteQueue, WriteId, WriteKind};
use crate::storage::KeyValueStore;

pub use crate::queue::Replayer;

/// Capacity of the notification channel; slow receivers miss the oldest events.
const EVENT_CAPACITY: usize = 64;

/// Per-read options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
  /// Probe connectivity now instead of trusting the last known state, so a
  /// stale "offline" belief does not keep the caller on cached data.
  pub force_refresh: bool,
}

/// How a write was handled. Both variants mean the write was accepted.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
  /// Sent and confirmed by the remote system
  Sent { result: Value },
  /// Stored for replay on reconnect
  Queued { id: WriteId },
}

impl WriteOutcome {
  pub fn is_queued(&self) -> bool {
    matches!(self, WriteOutcome::Queued { .. })
  }
}

/// User-facing notifications about connectivity and background sync.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  /// Connectivity came back
  Reconnected,
  /// Connectivity was lost; reads come from the cache and writes are queued
  Degraded,
  /// Queued writes are being replayed
  SyncStarted { pending: usize },
  /// Replay finished; `report.is_clean()` tells whether everything went through
  SyncFinished { report: DrainReport },
  /// The remote system permanently refused a queued write
  WriteDiscarded { id: WriteId },
}

struct Running {
  _subscription: Subscription,
  task: JoinHandle<()>,
}

struct CoordinatorInner<K> {
  cache: CacheStore,
  queue: PendingWriteQueue<K>,
  monitor: NetworkMonitor,
  replayer: Arc<dyn Replayer<K>>,
  refresh_keys: Mutex<Vec<String>>,
  draining: AtomicBool,
  events: broadcast::Sender<SyncEvent>,
  running: Mutex<Option<Running>>,
}

/// Chooses between live and cached data and replays queued writes on
/// reconnect.
pub struct SyncCoordinator<K> {
  inner: Arc<CoordinatorInner<K>>,
}

impl<K> Clone for SyncCoordinator<K> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<K: WriteKind> SyncCoordinator<K> {
  pub fn new(
    cache: CacheStore,
    queue: PendingWriteQueue<K>,
    monitor: NetworkMonitor,
    replayer: Arc<dyn Replayer<K>>,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(CoordinatorInner {
        cache,
        queue,
        monitor,
        replayer,
        refresh_keys: Mutex::new(Vec::new()),
        draining: AtomicBool::new(false),
        events,
        running: Mutex::new(None),
      }),
    }
  }

  /// Assemble a coordinator over `store` from `config`: cache namespace and
  /// TTL, refresh keys, probe timeout and a monitor polling `probe`.
  pub async fn from_config(
    config: &Config,
    store: Arc<dyn KeyValueStore>,
    probe: Arc<dyn ConnectivityProbe>,
    replayer: Arc<dyn Replayer<K>>,
  ) -> color_eyre::Result<Self> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = CacheStore::new(store.clone(), clock.clone(), config.cache_config());
    let queue = PendingWriteQueue::open(store, clock).await?;
    let monitor = config.network_monitor(probe);

    let coordinator = Self::new(cache, queue, monitor, replayer);
    Ok(coordinator.with_refresh_keys(config.cache.refresh_keys.clone()))
  }

  /// Cache keys to invalidate after queued writes were replayed, so reads do
  /// not serve data that predates them.
  pub fn with_refresh_keys(self, keys: Vec<String>) -> Self {
    if let Ok(mut refresh_keys) = self.inner.refresh_keys.lock() {
      *refresh_keys = keys;
    }
    self
  }

  pub fn cache(&self) -> &CacheStore {
    &self.inner.cache
  }

  pub fn queue(&self) -> &PendingWriteQueue<K> {
    &self.inner.queue
  }

  pub fn monitor(&self) -> &NetworkMonitor {
    &self.inner.monitor
  }

  /// Receive sync notifications from now on.
  pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  /// Read `key`, preferring the network while connected.
  ///
  /// Fails only with [`SyncError::NoDataAvailable`].
  pub async fn read<T, F, Fut>(
    &self,
    key: &str,
    fetch: F,
    opts: ReadOptions,
  ) -> Result<T, SyncError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>>,
  {
    self
      .read_detailed(key, fetch, opts)
      .await
      .map(|result| result.data)
  }

  /// Like [`read`](Self::read), also reporting where the data came from.
  ///
  /// 1. Connected: fetch, cache the result and return it
  /// 2. Fetch failed or offline: return the cached value if one is fresh
  /// 3. Nothing cached: `NoDataAvailable`
  pub async fn read_detailed<T, F, Fut>(
    &self,
    key: &str,
    fetch: F,
    opts: ReadOptions,
  ) -> Result<CacheResult<T>, SyncError>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = color_eyre::Result<T>>,
  {
    if !self.resolve_connected(opts.force_refresh).await {
      debug!(key, "offline, serving from cache");
      return match self.inner.cache.get_entry(key, GetOptions::default()).await {
        Some(entry) => Ok(CacheResult::offline(entry.value, entry.stored_at)),
        None => Err(no_data(key)),
      };
    }

    match fetch().await {
      Ok(data) => {
        self.inner.cache.put(key, &data).await;
        return Ok(CacheResult::from_network(data));
      }
      Err(e) => {
        let err = SyncError::TransientNetworkFailure(e.to_string());
        warn!(key, error = %err, "fetch failed, falling back to cache");
      }
    }

    match self.inner.cache.get_entry(key, GetOptions::default()).await {
      Some(entry) => Ok(CacheResult::fallback(entry.value, entry.stored_at)),
      None => Err(no_data(key)),
    }
  }

  /// Perform a write now if possible, otherwise queue it. Never fails and
  /// never waits for connectivity to return.
  pub async fn write<F, Fut>(&self, kind: K, payload: Value, send: F) -> WriteOutcome
  where
    F: FnOnce(Value) -> Fut,
    Fut: Future<Output = color_eyre::Result<Value>>,
  {
    if self.resolve_connected(false).await {
      match send(payload.clone()).await {
        Ok(result) => return WriteOutcome::Sent { result },
        Err(e) => {
          let err = SyncError::TransientNetworkFailure(e.to_string());
          warn!(?kind, error = %err, "send failed, queuing write");
        }
      }
    } else {
      debug!(?kind, "offline, queuing write");
    }

    let id = self.inner.queue.enqueue(kind, payload).await;
    WriteOutcome::Queued { id }
  }

  /// Replay the pending write queue. Runs on every reconnect edge.
  ///
  /// Returns `None` if another drain is already in flight; that drain's
  /// snapshot was taken earlier, so anything it misses waits for the next
  /// edge or [`retry_pending`](Self::retry_pending).
  pub async fn on_reconnect(&self) -> Option<DrainReport> {
    let Some(_guard) = DrainGuard::acquire(&self.inner.draining) else {
      debug!("drain already running, ignoring reconnect");
      return None;
    };

    let pending = self.inner.queue.len().await;
    if pending == 0 {
      return Some(DrainReport::default());
    }

    info!(pending, "replaying queued writes");
    self.emit(SyncEvent::SyncStarted { pending });

    let report = self.inner.queue.drain(self.inner.replayer.as_ref()).await;

    for id in &report.discarded {
      self.emit(SyncEvent::WriteDiscarded { id: *id });
    }

    if let Some(id) = report.failed.first() {
      let err = SyncError::QueueReplayFailure {
        id: *id,
        reason: report.failure_reason.clone().unwrap_or_default(),
      };
      warn!(error = %err, "queued writes left for the next reconnect");
    } else {
      self.invalidate_refresh_keys().await;
    }

    self.emit(SyncEvent::SyncFinished {
      report: report.clone(),
    });
    Some(report)
  }

  /// Manual retry: probe now and drain if online.
  pub async fn retry_pending(&self) -> Option<DrainReport> {
    if !self.inner.monitor.check_now().await {
      debug!("retry skipped, still offline");
      return None;
    }
    self.on_reconnect().await
  }

  /// Begin reacting to connectivity edges, and replay anything left over from
  /// a previous run if we are online. Calling `start` twice is a no-op.
  pub fn start(&self) {
    let Ok(mut running) = self.inner.running.lock() else {
      return;
    };
    if running.is_some() {
      return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_disconnect = tx.clone();
    let subscription = self.inner.monitor.subscribe(
      move || {
        let _ = tx.send(Transition::Connected);
      },
      move || {
        let _ = on_disconnect.send(Transition::Disconnected);
      },
    );

    let weak = Arc::downgrade(&self.inner);
    let task = tokio::spawn(async move {
      if let Some(coordinator) = Self::upgrade(&weak) {
        tokio::spawn(async move {
          coordinator.retry_pending().await;
        });
      }

      while let Some(transition) = rx.recv().await {
        let Some(coordinator) = Self::upgrade(&weak) else {
          break;
        };
        match transition {
          Transition::Connected => {
            coordinator.emit(SyncEvent::Reconnected);
            // Separate task so a reconnect during a drain reaches the guard.
            tokio::spawn(async move {
              coordinator.on_reconnect().await;
            });
          }
          Transition::Disconnected => {
            warn!("connectivity lost, working offline");
            coordinator.emit(SyncEvent::Degraded);
          }
        }
      }
    });

    *running = Some(Running {
      _subscription: subscription,
      task,
    });
    info!("sync coordinator started");
  }

  /// Stop reacting to connectivity edges. A drain already in flight finishes.
  pub fn stop(&self) {
    let running = match self.inner.running.lock() {
      Ok(mut running) => running.take(),
      Err(_) => None,
    };
    if let Some(running) = running {
      running.task.abort();
      info!("sync coordinator stopped");
    }
  }

  /// Connectivity to act on. Probes first when asked to or when nothing has
  /// been observed yet, so an unknown state never skips the network.
  async fn resolve_connected(&self, probe_now: bool) -> bool {
    let monitor = &self.inner.monitor;
    if probe_now || monitor.current_state() == ConnectivityState::Unknown {
      monitor.check_now().await
    } else {
      monitor.is_connected()
    }
  }

  fn upgrade(weak: &Weak<CoordinatorInner<K>>) -> Option<Self> {
    weak.upgrade().map(|inner| Self { inner })
  }

  fn emit(&self, event: SyncEvent) {
    // No receivers is fine
    let _ = self.inner.events.send(event);
  }

  async fn invalidate_refresh_keys(&self) {
    let keys = match self.inner.refresh_keys.lock() {
      Ok(keys) => keys.clone(),
      Err(_) => return,
    };
    for key in &keys {
      self.inner.cache.remove(key).await;
    }
    if !keys.is_empty() {
      debug!(count = keys.len(), "invalidated cache keys after replay");
    }
  }
}

fn no_data(key: &str) -> SyncError {
  SyncError::NoDataAvailable {
    key: key.to_string(),
  }
}

/// Holds the drain flag; clears it on drop, including on panic or abort.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}
