//! Size- and time-bounded telemetry queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::event::TelemetryEvent;
use super::sink::TelemetrySink;
use crate::network::{NetworkMonitor, Subscription};
use crate::storage::KeyValueStore;

/// Storage key holding the unsent events.
pub const TELEMETRY_KEY: &str = "telemetry_events";

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
  /// Queue length that triggers an automatic flush
  pub batch_size: usize,
  /// Period of the background flush timer
  pub flush_interval: Duration,
}

impl Default for TelemetryConfig {
  fn default() -> Self {
    Self {
      batch_size: 20,
      flush_interval: Duration::from_secs(60),
    }
  }
}

struct Running {
  _subscription: Subscription,
  timer: JoinHandle<()>,
}

struct BatcherInner {
  store: Arc<dyn KeyValueStore>,
  sink: Arc<dyn TelemetrySink>,
  config: TelemetryConfig,
  events: tokio::sync::Mutex<Vec<TelemetryEvent>>,
  flushing: AtomicBool,
  running: Mutex<Option<Running>>,
}

/// Batches telemetry events and ships them opportunistically.
///
/// A flush takes the first `n` events present when it starts and, once the
/// sink accepts them, removes exactly those `n`. Events recorded while the
/// send is in flight stay for the next flush.
#[derive(Clone)]
pub struct TelemetryBatcher {
  inner: Arc<BatcherInner>,
}

impl TelemetryBatcher {
  /// Create a batcher, restoring events left unsent by a previous run.
  pub async fn open(
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn TelemetrySink>,
    config: TelemetryConfig,
  ) -> Self {
    let events = match store.get_item(TELEMETRY_KEY).await {
      Ok(Some(raw)) => serde_json::from_str::<Vec<TelemetryEvent>>(&raw).unwrap_or_else(|e| {
        warn!(error = %e, "dropping unreadable telemetry backlog");
        Vec::new()
      }),
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to load telemetry backlog");
        Vec::new()
      }
    };

    Self {
      inner: Arc::new(BatcherInner {
        store,
        sink,
        config,
        events: tokio::sync::Mutex::new(events),
        flushing: AtomicBool::new(false),
        running: Mutex::new(None),
      }),
    }
  }

  /// Queue an event. Never fails and never waits on the network; reaching the
  /// batch size starts a flush in the background.
  pub async fn record(&self, event: TelemetryEvent) {
    let batch = {
      let mut events = self.inner.events.lock().await;
      events.push(event);
      self.persist(&events).await;

      if events.len() >= self.inner.config.batch_size {
        self.begin_flush(&events)
      } else {
        None
      }
    };

    if let Some(batch) = batch {
      let batcher = self.clone();
      tokio::spawn(async move {
        batcher.send(batch).await;
      });
    }
  }

  /// Send everything queued right now. Returns how many events were delivered;
  /// 0 if the queue was empty, a flush was already running, or the send failed.
  pub async fn flush(&self) -> usize {
    let batch = {
      let events = self.inner.events.lock().await;
      self.begin_flush(&events)
    };

    match batch {
      Some(batch) => self.send(batch).await,
      None => 0,
    }
  }

  /// Number of events waiting to be sent.
  pub async fn pending(&self) -> usize {
    self.inner.events.lock().await.len()
  }

  /// Flush on a timer and on every reconnect edge of `monitor`.
  pub fn start(&self, monitor: &NetworkMonitor) {
    let Ok(mut running) = self.inner.running.lock() else {
      return;
    };
    if running.is_some() {
      return;
    }

    let weak = Arc::downgrade(&self.inner);
    let on_connected = weak.clone();
    let subscription = monitor.subscribe(
      move || {
        let Some(inner) = on_connected.upgrade() else {
          return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
          return;
        };
        let batcher = TelemetryBatcher { inner };
        runtime.spawn(async move {
          batcher.flush().await;
        });
      },
      || {},
    );

    let interval = self.inner.config.flush_interval;
    let timer = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        TelemetryBatcher { inner }.flush().await;
      }
    });

    *running = Some(Running {
      _subscription: subscription,
      timer,
    });
  }

  pub fn stop(&self) {
    let running = match self.inner.running.lock() {
      Ok(mut running) => running.take(),
      Err(_) => None,
    };
    if let Some(running) = running {
      running.timer.abort();
    }
  }

  /// Claim the flush slot and slice the batch. `None` if there is nothing to
  /// send or another flush holds the slot.
  fn begin_flush(&self, events: &[TelemetryEvent]) -> Option<Vec<TelemetryEvent>> {
    if events.is_empty() {
      return None;
    }
    self
      .inner
      .flushing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()?;
    Some(events.to_vec())
  }

  async fn send(&self, batch: Vec<TelemetryEvent>) -> usize {
    let _slot = FlushSlot(&self.inner.flushing);

    if let Err(e) = self.inner.sink.send_batch(&batch).await {
      warn!(count = batch.len(), error = %e, "telemetry flush failed, keeping batch");
      return 0;
    }

    let mut events = self.inner.events.lock().await;
    let sent = batch.len().min(events.len());
    events.drain(..sent);
    self.persist(&events).await;
    debug!(sent, remaining = events.len(), "telemetry flushed");
    sent
  }

  async fn persist(&self, events: &[TelemetryEvent]) {
    let encoded = match serde_json::to_string(events) {
      Ok(encoded) => encoded,
      Err(e) => {
        warn!(error = %e, "failed to encode telemetry events");
        return;
      }
    };
    if let Err(e) = self.inner.store.set_item(TELEMETRY_KEY, encoded).await {
      warn!(error = %e, "failed to persist telemetry events");
    }
  }
}

/// Releases the flush slot when the send finishes or is cancelled.
struct FlushSlot<'a>(&'a AtomicBool);

impl Drop for FlushSlot<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}
