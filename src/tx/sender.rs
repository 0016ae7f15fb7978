//! Drip transaction sender

use super::gas::FeePolicy;
use super::nonce::NonceManager;
use crate::chain::{ChainProvider, GasPrice};
use crate::error::{DisperserError, DisperserResult};

use ethers::contract::abigen;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use tracing::{debug, info, warn};

abigen!(
    GasStation,
    r#"[
        function drip(uint256 usdcAmount, address recipient) external
    ]"#
);

/// How a failed submission should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendFailure {
    /// Local nonce is behind the chain
    NonceTooLow,
    /// Distributor wallet cannot pay for gas
    InsufficientFunds,
    /// A previous tx with the same nonce is still pending at a higher price
    Underpriced,
    Other,
}

fn classify_send_error(message: &str) -> SendFailure {
    let message = message.to_ascii_lowercase();
    if message.contains("nonce too low") {
        SendFailure::NonceTooLow
    } else if message.contains("insufficient funds") {
        SendFailure::InsufficientFunds
    } else if message.contains("replacement transaction underpriced") {
        SendFailure::Underpriced
    } else {
        SendFailure::Other
    }
}

/// Submits `drip(usdcAmount, recipient)` calls to gas station contracts
pub struct DripSender {
    /// Nonce manager shared by every chain
    nonce_manager: Arc<NonceManager>,
    /// Fee escalation applied to each network estimate
    fee_policy: Arc<dyn FeePolicy>,
}

impl DripSender {
    /// Create a new sender
    pub fn new(nonce_manager: Arc<NonceManager>, fee_policy: Arc<dyn FeePolicy>) -> Self {
        Self {
            nonce_manager,
            fee_policy,
        }
    }

    /// Submit one drip and return its hash once the node accepts it
    pub async fn send_drip(
        &self,
        provider: &ChainProvider,
        amount: U256,
        recipient: Address,
    ) -> DisperserResult<H256> {
        let chain_id = provider.chain_id();
        let client = provider.signer()?;
        let contract = GasStation::new(provider.config().contract()?, client.clone());

        let fees = self.fee_policy.apply(provider.fee_estimate().await?);
        let nonce = self
            .nonce_manager
            .allocate(provider, client.address())
            .await?;

        let mut call = contract
            .drip(amount, recipient)
            .nonce(nonce)
            .gas(self.fee_policy.gas_limit());

        call = match fees {
            GasPrice::Legacy(price) => call.legacy().gas_price(price),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                if let TypedTransaction::Eip1559(ref mut inner) = call.tx {
                    inner.max_fee_per_gas = Some(max_fee_per_gas);
                    inner.max_priority_fee_per_gas = Some(max_priority_fee_per_gas);
                }
                call
            }
        };

        debug!(
            chain_id,
            nonce,
            amount = %amount,
            recipient = ?recipient,
            "Submitting drip"
        );

        let result = call.send().await.map(|pending| pending.tx_hash());

        match result {
            Ok(tx_hash) => {
                info!(chain_id, nonce, tx_hash = ?tx_hash, "Drip submitted");
                Ok(tx_hash)
            }
            Err(e) => {
                let message = e.to_string();
                let reason = match classify_send_error(&message) {
                    SendFailure::NonceTooLow => {
                        warn!("Nonce too low on chain {}, resetting local nonce", chain_id);
                        self.nonce_manager.reset(chain_id).await;
                        format!("nonce too low: {}", message)
                    }
                    SendFailure::InsufficientFunds => {
                        self.nonce_manager.release(chain_id, nonce).await;
                        format!("insufficient funds for gas: {}", message)
                    }
                    SendFailure::Underpriced => {
                        self.nonce_manager.reset(chain_id).await;
                        format!("replacement transaction underpriced: {}", message)
                    }
                    SendFailure::Other => {
                        self.nonce_manager.release(chain_id, nonce).await;
                        message
                    }
                };

                warn!(chain_id, nonce, "Drip submission failed: {}", reason);
                Err(DisperserError::Dispatch { chain_id, reason })
            }
        }
    }
}
