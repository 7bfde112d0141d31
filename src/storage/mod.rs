//! Key/value persistence primitives.
//!
//! Everything above this module talks to storage only through
//! [`KeyValueStore`], which is injected as an `Arc<dyn KeyValueStore>`:
//! - [`SqliteStore`] is the durable backend used by the application
//! - [`MemoryStore`] is volatile and backs tests and throwaway sessions

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::KeyValueStore;
