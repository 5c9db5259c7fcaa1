//! chainpipe-bus: delivery of normalized events to the message bus.
//!
//! [`Publisher`] hands every source its own [`Lane`]: a bounded buffer and
//! a delivery task that retries until the bus acknowledges. Backends:
//! - [`memory`]: in-process log with an outage switch (tests)
//! - [`jsonl`]: append-only `<dir>/<topic>.jsonl` files (development)
//! - `kafka`: `rdkafka` idempotent producer (feature `kafka`)

pub mod jsonl;
pub mod memory;
pub mod publisher;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use jsonl::JsonlFileBus;
pub use memory::MemoryBus;
pub use publisher::{Lane, Publisher, PublisherConfig};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaBus, KafkaConfig};
