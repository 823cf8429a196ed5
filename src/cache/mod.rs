//! Partitioned response cache for offline support.
//!
//! This module provides:
//! - Named partitions (static assets seeded at install, dynamic responses
//!   captured at runtime) with per-version naming
//! - A storage seam with SQLite and in-memory backends
//! - A network-first layer that falls back to cached responses when the
//!   network is unavailable

mod layer;
mod partition;
mod storage;
mod traits;

pub use layer::{CacheLayer, NetworkFirst};
pub use partition::PartitionVersion;
pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheEntry, CacheResult, CacheSource, RequestKey};
