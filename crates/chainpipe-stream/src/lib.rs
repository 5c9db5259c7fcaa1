//! # chainpipe-stream
//!
//! Connection plumbing shared by the per-chain connectors.
//!
//! ```text
//! SourceConfig ──► credentials ──► WsSession (JSON-RPC over WebSocket)
//!                                      │
//!                                      ▼
//!                         pump task ──► RawRecordStream ──► SourceWorker
//! ```
//!
//! Also provides two chain-agnostic connectors: [`JsonLinesWsConnector`]
//! (the fallback for chain types without a dedicated connector) and
//! [`ChannelConnector`] (in-process, driven by a handle).

pub mod channel;
pub mod credentials;
pub mod jsonl;
pub mod pump;
pub mod session;

pub use channel::ChannelConnector;
pub use credentials::{resolve_endpoint, ResolvedEndpoint};
pub use jsonl::JsonLinesWsConnector;
pub use pump::{emit, spawn_record_stream, RecordSender};
pub use session::{notification_result, SessionConfig, WsSession};
