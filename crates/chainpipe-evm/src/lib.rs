//! # chainpipe-evm
//!
//! EVM support for chainpipe: [`EvmLogDecoder`] turns `eth_subscription` /
//! `eth_getLogs` log objects into normalized events, and [`EvmWsConnector`]
//! streams them from a node's WebSocket endpoint.

pub mod connector;
pub mod decoder;
pub mod quantity;
pub mod topics;

pub use connector::{build_log_filter, EvmWsConnector};
pub use decoder::{log_position, EvmLogDecoder, CHAIN_TYPE};
pub use quantity::parse_quantity;
