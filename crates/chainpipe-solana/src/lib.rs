//! # chainpipe-solana
//!
//! Solana support for chainpipe. Solana programs do not emit structured
//! logs like EVM contracts; each transaction's log messages are the unit of
//! ingestion:
//! - [`SolanaWsConnector`] subscribes with `logsSubscribe` and numbers
//!   notifications within each slot
//! - [`SolanaLogsDecoder`] classifies them by instruction name and extracts
//!   Anchor `Program data:` discriminators

pub mod connector;
pub mod decoder;

pub use connector::{annotate, build_logs_filter, SlotCounter, SolanaWsConnector};
pub use decoder::{SolanaLogsDecoder, CHAIN_TYPE};
