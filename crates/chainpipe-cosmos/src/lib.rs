//! # chainpipe-cosmos
//!
//! Cosmos / CosmWasm support for chainpipe.
//!
//! ## Event format
//!
//! Cosmos events follow the ABCI `Event` structure:
//! - `type`: string identifier (e.g. `"wasm"`, `"transfer"`, `"coin_received"`)
//! - `attributes`: list of `{key: String, value: String}` pairs
//!
//! [`CometWsConnector`] flattens each transaction's events into one raw
//! record per event; [`CosmosEventDecoder`] turns those into normalized
//! events positioned at `(height, tx_index << 16 | event_i)`.

pub mod connector;
pub mod decoder;

pub use connector::{flatten_tx_events, CometWsConnector, DEFAULT_QUERY};
pub use decoder::{parse_attributes, CosmosEventDecoder, CHAIN_TYPE};
