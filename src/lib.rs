//! Offline-first data layer.
//!
//! Reads are served network-first with a TTL cache as fallback, writes made
//! while offline are persisted in a FIFO queue and replayed when connectivity
//! returns, and telemetry is batched until it can be shipped.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod queue;
pub mod storage;
pub mod sync;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use cache::{CacheResult, CacheSource, CacheStore};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::{ReplayError, SyncError};
pub use network::{ConnectivityProbe, ConnectivityState, NetworkMonitor};
pub use queue::{DrainReport, PendingWriteItem, PendingWriteQueue, Replayer, WriteId};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use sync::{ReadOptions, SyncCoordinator, SyncEvent, WriteOutcome};
pub use telemetry::{TelemetryBatcher, TelemetryEvent, TelemetrySink};
