//! Edge-triggered connectivity state machine.

use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::probe::{ConnectivityProbe, ProbeReading};

/// What the monitor currently believes about connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  /// No probe result has arrived yet
  Unknown,
  Connected,
  Disconnected,
}

impl ConnectivityState {
  pub fn is_connected(self) -> bool {
    self == ConnectivityState::Connected
  }
}

/// A change of connectivity, as delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Connected,
  Disconnected,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

struct Observer {
  id: u64,
  on_connected: Callback,
  on_disconnected: Callback,
}

struct MonitorInner {
  probe: Arc<dyn ConnectivityProbe>,
  probe_timeout: Duration,
  state: Mutex<ConnectivityState>,
  /// Held from the state swap through callback dispatch
  transitions: Mutex<()>,
  observers: Mutex<Vec<Observer>>,
  next_observer_id: AtomicU64,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Wraps a raw probe and turns its level-triggered readings into
/// edge-triggered callbacks.
///
/// The first reading only sets the state. After that, a callback fires only
/// when a reading classifies differently from the current state, so a probe
/// that flaps or repeats itself during a radio handoff produces one event per
/// real change. A probe that errors is read as disconnected.
#[derive(Clone)]
pub struct NetworkMonitor {
  inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
  pub fn new(probe: Arc<dyn ConnectivityProbe>, probe_timeout: Duration) -> Self {
    Self {
      inner: Arc::new(MonitorInner {
        probe,
        probe_timeout,
        state: Mutex::new(ConnectivityState::Unknown),
        transitions: Mutex::new(()),
        observers: Mutex::new(Vec::new()),
        next_observer_id: AtomicU64::new(1),
        tasks: Mutex::new(Vec::new()),
      }),
    }
  }

  /// Synchronous snapshot of the current state.
  pub fn current_state(&self) -> ConnectivityState {
    match self.inner.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  pub fn is_connected(&self) -> bool {
    self.current_state().is_connected()
  }

  /// Register edge callbacks. They stay registered until the returned
  /// [`Subscription`] is unsubscribed or dropped.
  ///
  /// Callbacks run in transition order on the thread that observed the
  /// change. They must not feed readings back into this monitor.
  #[must_use = "dropping the subscription unsubscribes immediately"]
  pub fn subscribe<C, D>(&self, on_connected: C, on_disconnected: D) -> Subscription
  where
    C: Fn() + Send + Sync + 'static,
    D: Fn() + Send + Sync + 'static,
  {
    let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut observers) = self.inner.observers.lock() {
      observers.push(Observer {
        id,
        on_connected: Arc::new(on_connected),
        on_disconnected: Arc::new(on_disconnected),
      });
    }
    debug!(id, "connectivity subscriber added");

    Subscription {
      id,
      monitor: Arc::downgrade(&self.inner),
    }
  }

  /// Number of live subscriptions.
  pub fn subscriber_count(&self) -> usize {
    self.inner.observers.lock().map(|o| o.len()).unwrap_or(0)
  }

  /// Feed one probe result through the state machine.
  ///
  /// Returns the transition that fired, if any.
  pub fn observe(&self, reading: Result<ProbeReading>) -> Option<Transition> {
    self.apply(reading).1
  }

  /// Probe right now instead of waiting for the passive listener.
  ///
  /// The probe is bounded by the configured timeout; a timeout or probe error
  /// reports (and records) disconnected.
  pub async fn check_now(&self) -> bool {
    let timeout = self.inner.probe_timeout;
    let reading = match tokio::time::timeout(timeout, self.inner.probe.probe()).await {
      Ok(reading) => reading,
      Err(_) => Err(eyre!("probe timed out after {:?}", timeout)),
    };
    self.apply(reading).0.is_connected()
  }

  /// Feed readings pushed by a platform listener until the sender is dropped
  /// or [`stop`](Self::stop) is called.
  pub fn listen(&self, mut readings: mpsc::Receiver<ProbeReading>) {
    let weak = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      while let Some(reading) = readings.recv().await {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        NetworkMonitor { inner }.observe(Ok(reading));
      }
    });
    self.track(handle);
  }

  /// Actively probe on a fixed interval, starting immediately.
  pub fn poll_every(&self, interval: Duration) {
    let weak = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        NetworkMonitor { inner }.check_now().await;
      }
    });
    self.track(handle);
  }

  /// Stop background listeners and pollers. Subscriptions are untouched.
  pub fn stop(&self) {
    if let Ok(mut tasks) = self.inner.tasks.lock() {
      for task in tasks.drain(..) {
        task.abort();
      }
    }
  }

  fn track(&self, handle: JoinHandle<()>) {
    if let Ok(mut tasks) = self.inner.tasks.lock() {
      tasks.retain(|t| !t.is_finished());
      tasks.push(handle);
    }
  }

  fn apply(&self, reading: Result<ProbeReading>) -> (ConnectivityState, Option<Transition>) {
    let online = match reading {
      Ok(reading) => reading.is_online(),
      Err(e) => {
        warn!(error = %e, "connectivity probe failed, assuming disconnected");
        false
      }
    };
    let next = if online {
      ConnectivityState::Connected
    } else {
      ConnectivityState::Disconnected
    };

    let _ordered = match self.inner.transitions.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };

    let previous = {
      let mut state = match self.inner.state.lock() {
        Ok(state) => state,
        Err(poisoned) => poisoned.into_inner(),
      };
      std::mem::replace(&mut *state, next)
    };

    let transition = match previous {
      ConnectivityState::Unknown => {
        info!(state = ?next, "initial connectivity observed");
        None
      }
      previous if previous == next => None,
      _ if online => Some(Transition::Connected),
      _ => Some(Transition::Disconnected),
    };

    if let Some(transition) = transition {
      info!(?transition, "connectivity changed");
      self.notify(transition);
    }
    (next, transition)
  }

  fn notify(&self, transition: Transition) {
    // Clone out of the lock so callbacks may subscribe or unsubscribe.
    let callbacks: Vec<Callback> = match self.inner.observers.lock() {
      Ok(observers) => observers
        .iter()
        .map(|o| match transition {
          Transition::Connected => o.on_connected.clone(),
          Transition::Disconnected => o.on_disconnected.clone(),
        })
        .collect(),
      Err(_) => return,
    };

    for callback in callbacks {
      callback();
    }
  }
}

/// Handle to a registered pair of connectivity callbacks.
pub struct Subscription {
  id: u64,
  monitor: Weak<MonitorInner>,
}

impl Subscription {
  /// Remove the callbacks. Equivalent to dropping the subscription.
  pub fn unsubscribe(self) {}

  fn detach(&self) {
    if let Some(inner) = self.monitor.upgrade() {
      if let Ok(mut observers) = inner.observers.lock() {
        observers.retain(|o| o.id != self.id);
      }
      debug!(id = self.id, "connectivity subscriber removed");
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.detach();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_support::{ProbeStep, ScriptedProbe};
  use std::sync::atomic::AtomicUsize;

  struct Counters {
    connected: Arc<AtomicUsize>,
    disconnected: Arc<AtomicUsize>,
  }

  impl Counters {
    fn connected(&self) -> usize {
      self.connected.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> usize {
      self.disconnected.load(Ordering::SeqCst)
    }
  }

  fn monitor() -> NetworkMonitor {
    NetworkMonitor::new(
      Arc::new(ScriptedProbe::always(ProbeReading::online())),
      Duration::from_millis(100),
    )
  }

  fn counting(monitor: &NetworkMonitor) -> (Counters, Subscription) {
    let connected = Arc::new(AtomicUsize::new(0));
    let disconnected = Arc::new(AtomicUsize::new(0));
    let (c, d) = (connected.clone(), disconnected.clone());
    let sub = monitor.subscribe(
      move || {
        c.fetch_add(1, Ordering::SeqCst);
      },
      move || {
        d.fetch_add(1, Ordering::SeqCst);
      },
    );
    (
      Counters {
        connected,
        disconnected,
      },
      sub,
    )
  }

  #[test]
  fn test_first_observation_is_silent() {
    let monitor = monitor();
    let (counters, _sub) = counting(&monitor);
    assert_eq!(monitor.current_state(), ConnectivityState::Unknown);

    assert_eq!(monitor.observe(Ok(ProbeReading::online())), None);
    assert_eq!(monitor.current_state(), ConnectivityState::Connected);
    assert_eq!(counters.connected(), 0);
    assert_eq!(counters.disconnected(), 0);
  }

  #[test]
  fn test_duplicate_readings_coalesce() {
    let monitor = monitor();
    let (counters, _sub) = counting(&monitor);

    for reading in [
      ProbeReading::offline(),
      ProbeReading::offline(),
      ProbeReading::online(),
      ProbeReading::online(),
    ] {
      monitor.observe(Ok(reading));
    }

    assert_eq!(counters.connected(), 1);
    assert_eq!(counters.disconnected(), 0);
  }

  #[test]
  fn test_each_change_fires_once() {
    let monitor = monitor();
    let (counters, _sub) = counting(&monitor);

    monitor.observe(Ok(ProbeReading::online()));
    assert_eq!(
      monitor.observe(Ok(ProbeReading::offline())),
      Some(Transition::Disconnected)
    );
    assert_eq!(monitor.observe(Ok(ProbeReading::offline())), None);
    assert_eq!(
      monitor.observe(Ok(ProbeReading::unverified())),
      Some(Transition::Connected)
    );

    assert_eq!(counters.connected(), 1);
    assert_eq!(counters.disconnected(), 1);
  }

  #[test]
  fn test_probe_error_fails_closed() {
    let monitor = monitor();
    let (counters, _sub) = counting(&monitor);

    monitor.observe(Ok(ProbeReading::online()));
    let transition = monitor.observe(Err(eyre!("radio off")));

    assert_eq!(transition, Some(Transition::Disconnected));
    assert_eq!(monitor.current_state(), ConnectivityState::Disconnected);
    assert_eq!(counters.disconnected(), 1);
  }

  #[test]
  fn test_unsubscribe_and_drop_remove_observer() {
    let monitor = monitor();
    let (counters, sub) = counting(&monitor);
    let (other, other_sub) = counting(&monitor);
    assert_eq!(monitor.subscriber_count(), 2);

    sub.unsubscribe();
    drop(other_sub);
    assert_eq!(monitor.subscriber_count(), 0);

    monitor.observe(Ok(ProbeReading::offline()));
    monitor.observe(Ok(ProbeReading::online()));
    assert_eq!(counters.connected(), 0);
    assert_eq!(other.connected(), 0);
  }

  #[tokio::test]
  async fn test_check_now_updates_state() {
    let probe = ScriptedProbe::new(vec![
      ProbeStep::Reading(ProbeReading::offline()),
      ProbeStep::Reading(ProbeReading::online()),
      ProbeStep::Fail,
    ]);
    let monitor = NetworkMonitor::new(Arc::new(probe), Duration::from_millis(100));
    let (counters, _sub) = counting(&monitor);

    assert!(!monitor.check_now().await);
    assert!(monitor.check_now().await);
    assert_eq!(counters.connected(), 1);
    assert!(!monitor.check_now().await);
    assert_eq!(counters.disconnected(), 1);
  }

  #[tokio::test]
  async fn test_check_now_timeout_reports_disconnected() {
    let probe = ScriptedProbe::new(vec![ProbeStep::Hang]);
    let monitor = NetworkMonitor::new(Arc::new(probe), Duration::from_millis(20));

    assert!(!monitor.check_now().await);
    assert_eq!(monitor.current_state(), ConnectivityState::Disconnected);
  }

  #[tokio::test]
  async fn test_listen_feeds_readings() {
    let monitor = monitor();
    let (counters, _sub) = counting(&monitor);
    let (tx, rx) = mpsc::channel(8);
    monitor.listen(rx);

    for reading in [
      ProbeReading::offline(),
      ProbeReading::offline(),
      ProbeReading::online(),
    ] {
      tx.send(reading).await.unwrap();
    }

    for _ in 0..100 {
      if counters.connected() == 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(counters.connected(), 1);
    assert_eq!(monitor.current_state(), ConnectivityState::Connected);
    monitor.stop();
  }

  #[tokio::test]
  async fn test_poll_every_drives_the_probe() {
    let probe = ScriptedProbe::new(vec![
      ProbeStep::Reading(ProbeReading::offline()),
      ProbeStep::Reading(ProbeReading::online()),
    ]);
    let monitor = NetworkMonitor::new(Arc::new(probe), Duration::from_millis(100));
    let (counters, _sub) = counting(&monitor);
    monitor.poll_every(Duration::from_millis(10));

    for _ in 0..200 {
      if counters.connected() == 1 {
        break;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(counters.connected(), 1);
    assert_eq!(counters.disconnected(), 0);

    monitor.stop();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(counters.connected(), 1);
  }

  #[test]
  fn test_concurrent_readings_notify_in_state_order() {
    let monitor = monitor();
    monitor.observe(Ok(ProbeReading::offline()));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let (up, down) = (delivered.clone(), delivered.clone());
    let _sub = monitor.subscribe(
      move || up.lock().unwrap().push(Transition::Connected),
      move || down.lock().unwrap().push(Transition::Disconnected),
    );

    std::thread::scope(|scope| {
      for worker in 0..4 {
        let monitor = monitor.clone();
        scope.spawn(move || {
          for n in 0..500 {
            let reading = if (n + worker) % 2 == 0 {
              ProbeReading::online()
            } else {
              ProbeReading::offline()
            };
            monitor.observe(Ok(reading));
          }
        });
      }
    });

    let delivered = delivered.lock().unwrap();
    assert!(delivered.windows(2).all(|pair| pair[0] != pair[1]));
    let last = delivered.last().copied();
    let expected = match monitor.current_state() {
      ConnectivityState::Connected => Some(Transition::Connected),
      _ => Some(Transition::Disconnected),
    };
    assert!(last.is_none() || last == expected);
  }
}
