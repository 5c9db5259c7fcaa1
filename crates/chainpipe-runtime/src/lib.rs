//! # chainpipe-runtime
//!
//! The long-running half of chainpipe: one [`SourceWorker`] task per
//! enabled source and a [`Supervisor`] task that starts, restarts and stops
//! them as the source registry changes.
//!
//! ```text
//! ConfigStore ──► Supervisor ──spawn/cancel──► SourceWorker × N
//!                    ▲                             │
//!                    └──── StatusReport (mpsc) ────┘
//!                                                  │
//!                  connector ─► decoder ─► dedup ─► publisher lane ─► bus
//! ```

pub mod context;
pub mod shutdown;
pub mod supervisor;
pub mod worker;

pub use context::PipelineContext;
pub use shutdown::{cancel_on_signal, shutdown_signal};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorHandle};
pub use worker::{ReportKind, SourceWorker, StatusReport, WorkerConfig, WorkerStats};
