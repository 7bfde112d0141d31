//! Best-effort analytics batching.
//!
//! Events are kept in a persisted list and shipped in batches when the list
//! reaches a threshold, on a timer, and whenever connectivity returns. Loss is
//! tolerated here in a way it is not for pending writes.

mod batcher;
mod event;
mod sink;

pub use batcher::{TelemetryBatcher, TelemetryConfig};
pub use event::{AttributeValue, TelemetryEvent};
pub use sink::{HttpTelemetrySink, TelemetrySink};
