//! Retry and crash-loop policies shared by workers, publisher lanes and the
//! supervisor.

pub mod backoff;
pub mod restart;

pub use backoff::{Backoff, BackoffConfig};
pub use restart::{RestartPolicy, RestartWindow};
