//! # chainpipe-observability
//!
//! OpenTelemetry-based observability for chainpipe.
//!
//! ## Built-in metrics
//! - `chainpipe.records_received`: counter, tagged with source + chain
//! - `chainpipe.events_published`: counter, tagged with source + chain
//! - `chainpipe.decode_errors`: counter, tagged with chain + error_type
//! - `chainpipe.duplicates_skipped`: counter, tagged with source
//! - `chainpipe.cache_errors`: counter
//! - `chainpipe.publish_retries`: counter, tagged with source
//! - `chainpipe.worker_restarts`: counter, tagged with source + reason
//! - `chainpipe.publish_latency_ms`: histogram, enqueue to bus ack
//!
//! Instruments come from the global meter, so they are no-ops until the
//! embedding binary installs a meter provider.
//!
//! ## Structured logging
//! JSON-structured logs compatible with ELK, Loki, CloudWatch.
//! Log levels configurable per component.

pub mod metrics;
pub mod tracing_setup;

pub use metrics::PipelineMetrics;
pub use tracing_setup::{init_tracing, LogConfig};
