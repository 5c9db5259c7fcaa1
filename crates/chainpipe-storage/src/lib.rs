//! chainpipe-storage: checkpoint and dedup cache backends.
//!
//! Backends:
//! - [`file`]: one JSON file per source (checkpoint store without `sqlite`)
//! - [`memory_cache`]: in-process TTL cache (single instance, no persistence)
//! - [`sqlite`]: SQLite via `sqlx`, serves both checkpoints and the cache
//!
//! The in-memory checkpoint store lives in `chainpipe-core` next to the
//! trait it implements.

pub mod file;
pub mod memory_cache;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileCheckpointStore;
pub use memory_cache::MemoryCache;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
