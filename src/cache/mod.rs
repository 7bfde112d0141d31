//! TTL-bounded cache for read responses.
//!
//! This module provides a resource-agnostic cache that:
//! - Stores whole JSON values under string keys with the time they were written
//! - Enforces expiry lazily at read time (no background sweep)
//! - Treats storage and decoding failures as misses so callers never fail on it
//! - Reports where a coordinator read was served from via [`CacheResult`]

mod store;
mod traits;

pub use store::{CacheConfig, CacheStore, CachedEntry, GetOptions};
pub use traits::{CacheResult, CacheSource};
