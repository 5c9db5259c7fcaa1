//! # chainpipe-registry
//!
//! [`ConfigStore`](chainpipe_core::ConfigStore) backends:
//! - [`MemoryConfigStore`]: in-process, broadcast-fed watches
//! - [`DirectoryConfigStore`]: one definition file per source, polled

pub mod directory;
pub mod memory;

pub use directory::DirectoryConfigStore;
pub use memory::MemoryConfigStore;
