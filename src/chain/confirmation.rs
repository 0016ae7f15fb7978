//! Confirmation watching for broadcast drip transactions
//!
//! A transaction counts as confirmed once the chain head is at least
//! `confirmations - 1` blocks past its inclusion block. With the default depth
//! of 1 that is simply "mined".

use super::ChainProvider;
use crate::error::{DisperserError, DisperserResult};

use ethers::types::{TransactionReceipt, H256, U256};
use std::time::Duration;
use tracing::debug;

/// Outcome of a successful confirmation watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationReceipt {
    pub block_number: u64,
    pub gas_used: U256,
    /// On-chain status, 1 for success
    pub status: u64,
}

/// Polls a chain until a transaction reaches the requested depth
pub struct ConfirmationWatcher {
    poll_interval: Duration,
}

impl ConfirmationWatcher {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Wait for `confirmations` blocks or fail after `timeout`
    pub async fn wait(
        &self,
        provider: &ChainProvider,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> DisperserResult<ConfirmationReceipt> {
        match tokio::time::timeout(timeout, self.poll(provider, tx_hash, confirmations)).await {
            Ok(result) => result,
            Err(_) => Err(DisperserError::ConfirmationTimeout {
                chain_id: provider.chain_id(),
                tx_hash: format!("{:?}", tx_hash),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    async fn poll(
        &self,
        provider: &ChainProvider,
        tx_hash: H256,
        confirmations: u64,
    ) -> DisperserResult<ConfirmationReceipt> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            ticker.tick().await;

            let receipt = match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => receipt,
                Ok(None) => continue,
                // Transient RPC errors are retried until the timeout fires
                Err(e) if e.is_retryable() => {
                    debug!("Receipt poll failed for {:?}: {}", tx_hash, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let current_block = match provider.get_block_number().await {
                Ok(block) => block,
                Err(e) if e.is_retryable() => continue,
                Err(e) => return Err(e),
            };

            if let Some(confirmed) =
                evaluate(provider.chain_id(), &receipt, current_block, confirmations)?
            {
                return Ok(confirmed);
            }

            debug!(
                "Transaction {:?} on chain {} not yet at depth {}",
                tx_hash,
                provider.chain_id(),
                confirmations
            );
        }
    }
}

/// Number of blocks including and after `included_in`
pub fn confirmation_depth(current_block: u64, included_in: u64) -> u64 {
    if current_block < included_in {
        0
    } else {
        current_block - included_in + 1
    }
}

/// Decide whether a mined receipt is final enough
fn evaluate(
    chain_id: u64,
    receipt: &TransactionReceipt,
    current_block: u64,
    confirmations: u64,
) -> DisperserResult<Option<ConfirmationReceipt>> {
    let block_number = match receipt.block_number {
        Some(block) => block.as_u64(),
        None => return Ok(None),
    };

    let status = receipt.status.map(|s| s.as_u64()).unwrap_or(1);
    if status == 0 {
        return Err(DisperserError::TransactionReverted {
            chain_id,
            tx_hash: format!("{:?}", receipt.transaction_hash),
            block_number,
        });
    }

    if confirmation_depth(current_block, block_number) < confirmations.max(1) {
        return Ok(None);
    }

    Ok(Some(ConfirmationReceipt {
        block_number,
        gas_used: receipt.gas_used.unwrap_or_default(),
        status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use ethers::types::U64;

    fn receipt(block: Option<u64>, status: u64, gas_used: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: H256::repeat_byte(0xab),
            block_number: block.map(U64::from),
            status: Some(U64::from(status)),
            gas_used: Some(U256::from(gas_used)),
            ..Default::default()
        }
    }

    #[test]
    fn test_depth_counts_inclusion_block() {
        assert_eq!(confirmation_depth(100, 100), 1);
        assert_eq!(confirmation_depth(104, 100), 5);
        assert_eq!(confirmation_depth(99, 100), 0);
    }

    #[test]
    fn test_single_confirmation_when_mined() {
        let result = evaluate(10, &receipt(Some(500), 1, 52_000), 500, 1).unwrap();
        assert_eq!(
            result,
            Some(ConfirmationReceipt {
                block_number: 500,
                gas_used: U256::from(52_000u64),
                status: 1,
            })
        );
    }

    #[test]
    fn test_waits_for_depth() {
        assert_eq!(evaluate(10, &receipt(Some(500), 1, 1), 501, 3).unwrap(), None);
        assert!(evaluate(10, &receipt(Some(500), 1, 1), 502, 3)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_pending_receipt_not_confirmed() {
        assert_eq!(evaluate(10, &receipt(None, 1, 1), 900, 1).unwrap(), None);
    }

    #[test]
    fn test_reverted_receipt() {
        let err = evaluate(137, &receipt(Some(42), 0, 30_000), 50, 1).unwrap_err();
        match err {
            DisperserError::TransactionReverted {
                chain_id,
                block_number,
                ..
            } => {
                assert_eq!(chain_id, 137);
                assert_eq!(block_number, 42);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(DisperserError::TransactionReverted {
            chain_id: 1,
            tx_hash: String::new(),
            block_number: 1
        }
        .should_alert());
    }

    #[tokio::test]
    async fn test_wait_times_out_when_receipt_never_arrives() {
        let provider = ChainProvider::new(
            ChainConfig {
                chain_id: 10,
                name: "Optimism".to_string(),
                rpc_url: "http://127.0.0.1:1".to_string(),
                contract_address: "0x3333333333333333333333333333333333333333".to_string(),
                explorer_url: "https://optimistic.etherscan.io".to_string(),
                native_symbol: "ETH".to_string(),
                enabled: true,
            },
            None,
        )
        .unwrap();
        let watcher = ConfirmationWatcher::new(Duration::from_millis(10));

        let err = watcher
            .wait(&provider, H256::repeat_byte(0x01), 1, Duration::from_millis(150))
            .await
            .unwrap_err();

        match err {
            DisperserError::ConfirmationTimeout {
                chain_id, tx_hash, ..
            } => {
                assert_eq!(chain_id, 10);
                assert_eq!(tx_hash, format!("{:?}", H256::repeat_byte(0x01)));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
