//! Per-chain RPC provider and signing client

use crate::config::ChainConfig;
use crate::error::{DisperserError, DisperserResult};

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Signing client used to submit drip calls
pub type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Provider for one destination chain
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// Read-only HTTP provider
    http: Provider<Http>,
    /// Signing client, absent when no distributor key is configured
    signer: Option<Arc<SignerClient>>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig, wallet: Option<LocalWallet>) -> DisperserResult<Self> {
        let http = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| DisperserError::ChainConnection {
                chain_id: config.chain_id,
                message: format!("Invalid RPC URL: {}", e),
            })?
            .interval(Duration::from_millis(100));

        debug!("Added HTTP provider for chain {}: {}", config.chain_id, config.rpc_url);

        let signer = wallet.map(|w| {
            let w = w.with_chain_id(config.chain_id);
            Arc::new(SignerMiddleware::new(http.clone(), w))
        });

        if signer.is_none() {
            warn!(
                "No distributor key for chain {}, dispatches will fail",
                config.chain_id
            );
        }

        Ok(Self {
            config,
            http,
            signer,
        })
    }

    /// Get the signing client
    pub fn signer(&self) -> DisperserResult<Arc<SignerClient>> {
        self.signer.clone().ok_or_else(|| DisperserError::Dispatch {
            chain_id: self.config.chain_id,
            reason: "no signer configured".to_string(),
        })
    }

    /// Address the distributor signs with
    pub fn signer_address(&self) -> Option<Address> {
        self.signer.as_ref().map(|s| s.address())
    }

    /// Get current block number
    pub async fn get_block_number(&self) -> DisperserResult<u64> {
        self.http
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .map_err(|e| self.connection_error(e))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> DisperserResult<Option<TransactionReceipt>> {
        self.http
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Pending transaction count for an address
    pub async fn get_transaction_count(&self, address: Address) -> DisperserResult<u64> {
        self.http
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| self.connection_error(e))
    }

    /// Current network fee estimate
    ///
    /// Chains whose latest block carries a base fee are priced with EIP-1559
    /// fields, everything else with a legacy gas price.
    pub async fn fee_estimate(&self) -> DisperserResult<GasPrice> {
        let block = self
            .http
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.connection_error(e))?;

        let supports_1559 = block.and_then(|b| b.base_fee_per_gas).is_some();

        if supports_1559 {
            let (max_fee, priority_fee) = self
                .http
                .estimate_eip1559_fees(None)
                .await
                .map_err(|e| self.connection_error(e))?;
            Ok(GasPrice::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority_fee,
            })
        } else {
            let price = self
                .http
                .get_gas_price()
                .await
                .map_err(|e| self.connection_error(e))?;
            Ok(GasPrice::Legacy(price))
        }
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    /// Get chain configuration
    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> DisperserError {
        DisperserError::ChainConnection {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        }
    }
}

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
