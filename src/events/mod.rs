//! Deposit event payloads and ingestion validation
//!
//! The chain listener forwards every `Deposited` log from the escrow contract
//! as a `DepositEvent`. Nothing is created from a payload that fails
//! `validate`.

use crate::error::{DisperserError, DisperserResult};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One destination split as emitted by the escrow contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationPayload {
    pub dest_chain_id: u64,
    pub amount_usd: String,
}

/// Deposit event as delivered by the listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositEvent {
    /// Source chain id
    pub chain_id: u64,
    /// Deposit transaction hash; becomes the intent id
    pub tx_hash: String,
    #[serde(default)]
    pub log_index: Option<u64>,
    pub block_number: u64,
    #[serde(default)]
    pub block_timestamp: Option<u64>,
    pub user: String,
    pub token_address: String,
    #[serde(default)]
    pub token_symbol: Option<String>,
    pub amount_token_raw: String,
    pub amount_usd: String,
    pub allocations: Vec<AllocationPayload>,
}

impl DepositEvent {
    /// Idempotency key for the intent created from this event
    pub fn intent_id(&self) -> String {
        self.tx_hash.to_ascii_lowercase()
    }

    /// Reject malformed payloads before any intent exists
    pub fn validate(&self) -> DisperserResult<()> {
        if self.chain_id == 0 {
            return Err(invalid("chainId must be positive"));
        }
        if !is_tx_hash(&self.tx_hash) {
            return Err(invalid("Invalid tx hash format"));
        }
        if self.block_number == 0 {
            return Err(invalid("blockNumber must be positive"));
        }
        if !is_address(&self.user) {
            return Err(invalid("Invalid user address format"));
        }
        if !is_address(&self.token_address) {
            return Err(invalid("Invalid token address format"));
        }
        if self.amount_token_raw.is_empty()
            || !self.amount_token_raw.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid("amountTokenRaw must be an unsigned integer string"));
        }
        if !is_decimal(&self.amount_usd) {
            return Err(invalid("amountUsd must be a decimal string"));
        }
        if self.allocations.is_empty() {
            return Err(invalid("At least one allocation is required"));
        }

        let mut seen = HashSet::new();
        for alloc in &self.allocations {
            if alloc.dest_chain_id == 0 {
                return Err(invalid("destChainId must be positive"));
            }
            if !is_decimal(&alloc.amount_usd) {
                return Err(invalid(&format!(
                    "Allocation for chain {} has an invalid amountUsd",
                    alloc.dest_chain_id
                )));
            }
            if !seen.insert(alloc.dest_chain_id) {
                return Err(invalid(&format!(
                    "Duplicate allocation for chain {}",
                    alloc.dest_chain_id
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> DisperserError {
    DisperserError::Validation(message.to_string())
}

fn is_hex_of_len(value: &str, hex_len: usize) -> bool {
    match value.strip_prefix("0x") {
        Some(body) => body.len() == hex_len && hex::decode(body).is_ok(),
        None => false,
    }
}

/// `0x` followed by 64 hex characters
pub fn is_tx_hash(value: &str) -> bool {
    is_hex_of_len(value, 64)
}

/// `0x` followed by 40 hex characters
pub fn is_address(value: &str) -> bool {
    is_hex_of_len(value, 40)
}

/// Non-negative decimal such as "20", "0.75" or "1.250000"
fn is_decimal(value: &str) -> bool {
    let mut parts = value.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();

    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(whole) && fraction.map_or(true, digits)
}
