//! Connectivity observation.
//!
//! [`NetworkMonitor`] is the only source of the reconnect signal. It depends on
//! nothing but an injected [`ConnectivityProbe`] and whatever pushes
//! [`ProbeReading`]s into it.

mod monitor;
mod probe;

pub use monitor::{ConnectivityState, NetworkMonitor, Subscription, Transition};
pub use probe::{ConnectivityProbe, HttpProbe, ProbeReading};
