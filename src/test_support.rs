//! Fakes shared by the unit tests.

use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ReplayError;
use crate::network::{ConnectivityProbe, ProbeReading};
use crate::storage::{KeyValueStore, MemoryStore};
use crate::sync::Replayer;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Memory store whose reads or writes can be switched to fail.
#[derive(Default)]
pub struct FlakyStore {
  inner: MemoryStore,
  fail_writes: AtomicBool,
  fail_reads: AtomicBool,
}

impl FlakyStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn fail_reads(&self, fail: bool) {
    self.fail_reads.store(fail, Ordering::SeqCst);
  }
}

impl KeyValueStore for FlakyStore {
  fn get_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return future::ready(Err(eyre!("disk unavailable"))).boxed();
    }
    self.inner.get_item(key)
  }

  fn set_item<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return future::ready(Err(eyre!("disk full"))).boxed();
    }
    self.inner.set_item(key, value)
  }

  fn remove_item<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return future::ready(Err(eyre!("disk full"))).boxed();
    }
    self.inner.remove_item(key)
  }

  fn get_all_keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
    if self.fail_reads.load(Ordering::SeqCst) {
      return future::ready(Err(eyre!("disk unavailable"))).boxed();
    }
    self.inner.get_all_keys()
  }
}

/// What the scripted probe does on its next call.
#[derive(Debug, Clone)]
pub enum ProbeStep {
  Reading(ProbeReading),
  Fail,
  Hang,
}

/// Probe that replays a script, repeating the last step once exhausted.
pub struct ScriptedProbe {
  steps: Mutex<VecDeque<ProbeStep>>,
  last: Mutex<ProbeStep>,
}

impl ScriptedProbe {
  pub fn new(steps: Vec<ProbeStep>) -> Self {
    Self {
      steps: Mutex::new(steps.into()),
      last: Mutex::new(ProbeStep::Reading(ProbeReading::offline())),
    }
  }

  pub fn always(reading: ProbeReading) -> Self {
    Self::new(vec![ProbeStep::Reading(reading)])
  }

  fn next_step(&self) -> ProbeStep {
    let mut steps = self.steps.lock().unwrap();
    let mut last = self.last.lock().unwrap();
    if let Some(step) = steps.pop_front() {
      *last = step;
    }
    last.clone()
  }
}

impl ConnectivityProbe for ScriptedProbe {
  fn probe(&self) -> BoxFuture<'_, Result<ProbeReading>> {
    let step = self.next_step();
    async move {
      match step {
        ProbeStep::Reading(reading) => Ok(reading),
        ProbeStep::Fail => Err(eyre!("probe exploded")),
        ProbeStep::Hang => {
          tokio::time::sleep(Duration::from_secs(3600)).await;
          Ok(ProbeReading::online())
        }
      }
    }
    .boxed()
  }
}

/// Operation tags used by coordinator and queue tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestOp {
  CreateMeeting,
  UpdateMeeting,
  SubmitHomework,
}

/// Replayer that records every call and answers from a per-call script.
#[derive(Default)]
pub struct ScriptedReplayer {
  calls: Mutex<Vec<(TestOp, Value)>>,
  script: Mutex<VecDeque<std::result::Result<Value, ReplayError>>>,
}

impl ScriptedReplayer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue the outcome of the next replay. Unscripted calls succeed.
  pub fn then(&self, outcome: std::result::Result<Value, ReplayError>) -> &Self {
    self.script.lock().unwrap().push_back(outcome);
    self
  }

  pub fn calls(&self) -> Vec<(TestOp, Value)> {
    self.calls.lock().unwrap().clone()
  }
}

impl Replayer<TestOp> for ScriptedReplayer {
  fn replay<'a>(
    &'a self,
    kind: &'a TestOp,
    payload: &'a Value,
  ) -> BoxFuture<'a, std::result::Result<Value, ReplayError>> {
    self.calls.lock().unwrap().push((*kind, payload.clone()));
    let outcome = self
      .script
      .lock()
      .unwrap()
      .pop_front()
      .unwrap_or_else(|| Ok(Value::Null));
    future::ready(outcome).boxed()
  }
}

/// Sink that forwards every batch to a channel.
pub struct RecordingSink {
  tx: mpsc::UnboundedSender<Vec<TelemetryEvent>>,
  fail: AtomicBool,
}

impl RecordingSink {
  pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<TelemetryEvent>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
      Arc::new(Self {
        tx,
        fail: AtomicBool::new(false),
      }),
      rx,
    )
  }

  pub fn fail(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }
}

impl TelemetrySink for RecordingSink {
  fn send_batch<'a>(&'a self, events: &'a [TelemetryEvent]) -> BoxFuture<'a, Result<()>> {
    let result = if self.fail.load(Ordering::SeqCst) {
      Err(eyre!("collector unreachable"))
    } else {
      let _ = self.tx.send(events.to_vec());
      Ok(())
    };
    future::ready(result).boxed()
  }
}
