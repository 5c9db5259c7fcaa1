//! Well-known event signatures.
//!
//! topic0 of an EVM log is the keccak256 hash of the event's canonical
//! signature, e.g. `keccak256("Transfer(address,address,uint256)")`.

use alloy_primitives::{keccak256, B256};
use std::sync::OnceLock;

pub const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";
pub const APPROVAL_SIGNATURE: &str = "Approval(address,address,uint256)";

/// `0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef`
pub fn transfer_topic() -> B256 {
    static TOPIC: OnceLock<B256> = OnceLock::new();
    *TOPIC.get_or_init(|| keccak256(TRANSFER_SIGNATURE))
}

/// `0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925`
pub fn approval_topic() -> B256 {
    static TOPIC: OnceLock<B256> = OnceLock::new();
    *TOPIC.get_or_init(|| keccak256(APPROVAL_SIGNATURE))
}
