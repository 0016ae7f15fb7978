//! Chain module - dispatches drips and watches them to confirmation
//!
//! This module provides:
//! - One RPC provider and signing client per destination chain
//! - The `ChainGateway` seam the orchestrator talks to
//! - Confirmation watching with a hard timeout

pub mod confirmation;
pub mod provider;

pub use confirmation::{ConfirmationReceipt, ConfirmationWatcher};
pub use provider::{ChainProvider, GasPrice};

use crate::config::{ChainRegistry, DispersalConfig, WalletConfig};
use crate::error::{DisperserError, DisperserResult};
use crate::tx::{DripSender, FeePolicy, NonceManager};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Result of a successful dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub tx_hash: H256,
    pub explorer_url: String,
}

/// Sends value to destination chains and reports on it
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Submit a drip of `amount_raw` token units to `recipient`.
    /// Fails with `Dispatch` when nothing was broadcast.
    async fn dispatch(
        &self,
        chain_id: u64,
        amount_raw: U256,
        recipient: Address,
    ) -> DisperserResult<DispatchReceipt>;

    /// Suspend until `tx_hash` is `confirmations` deep or `timeout` elapses
    async fn await_confirmation(
        &self,
        chain_id: u64,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> DisperserResult<ConfirmationReceipt>;
}

/// Read the distributor key named by the wallet config
pub fn load_wallet(config: &WalletConfig) -> DisperserResult<Option<LocalWallet>> {
    match config.private_key() {
        Some(key) => key
            .parse::<LocalWallet>()
            .map(Some)
            .map_err(|e| DisperserError::Config(format!("Invalid private key: {}", e))),
        None => {
            warn!(
                "{} not set, gateway will reject every dispatch",
                config.private_key_env
            );
            Ok(None)
        }
    }
}

/// Gateway backed by JSON-RPC providers for every configured EVM chain
pub struct EvmChainGateway {
    /// Destination chain configuration
    registry: Arc<ChainRegistry>,
    /// Distributor key, bound to each chain's id on first use
    wallet: Option<LocalWallet>,
    /// Chain providers indexed by chain ID, created on first use
    providers: DashMap<u64, Arc<ChainProvider>>,
    /// Drip submission
    sender: DripSender,
    /// Confirmation polling
    watcher: ConfirmationWatcher,
}

impl EvmChainGateway {
    /// Create a new gateway; no RPC connection is made until a chain is used
    pub fn new(
        registry: Arc<ChainRegistry>,
        wallet: Option<LocalWallet>,
        fee_policy: Arc<dyn FeePolicy>,
        config: &DispersalConfig,
    ) -> Self {
        Self {
            registry,
            wallet,
            providers: DashMap::new(),
            sender: DripSender::new(Arc::new(NonceManager::new()), fee_policy),
            watcher: ConfirmationWatcher::new(config.poll_interval()),
        }
    }

    /// Get provider for a specific chain, creating it on first use
    pub fn get_provider(&self, chain_id: u64) -> DisperserResult<Arc<ChainProvider>> {
        if let Some(provider) = self.providers.get(&chain_id) {
            return Ok(provider.clone());
        }

        let chain_config = self.registry.get(chain_id)?;
        let provider = self
            .providers
            .entry(chain_id)
            .or_try_insert_with(|| {
                info!(
                    "Initializing chain {} (ID: {})",
                    chain_config.name, chain_config.chain_id
                );
                ChainProvider::new(chain_config.clone(), self.wallet.clone()).map(Arc::new)
            })?
            .clone();

        Ok(provider)
    }

    /// Health check for all configured chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let mut results = Vec::new();

        for chain_id in self.registry.chain_ids() {
            let healthy = match self.get_provider(chain_id) {
                Ok(provider) => provider.health_check().await,
                Err(e) => {
                    warn!("Cannot build provider for chain {}: {}", chain_id, e);
                    false
                }
            };
            crate::metrics::record_chain_health(chain_id, healthy);
            results.push((chain_id, healthy));
        }

        results
    }

    /// Chain IDs with a provider already created
    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.providers.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }
}

#[async_trait]
impl ChainGateway for EvmChainGateway {
    async fn dispatch(
        &self,
        chain_id: u64,
        amount_raw: U256,
        recipient: Address,
    ) -> DisperserResult<DispatchReceipt> {
        let provider = self.get_provider(chain_id).map_err(|e| DisperserError::Dispatch {
            chain_id,
            reason: e.to_string(),
        })?;

        let tx_hash = self
            .sender
            .send_drip(&provider, amount_raw, recipient)
            .await
            .map_err(|e| match e {
                DisperserError::Dispatch { .. } => e,
                other => DisperserError::Dispatch {
                    chain_id,
                    reason: other.to_string(),
                },
            })?;

        Ok(DispatchReceipt {
            tx_hash,
            explorer_url: provider
                .config()
                .explorer_tx_url(&format!("{:?}", tx_hash)),
        })
    }

    async fn await_confirmation(
        &self,
        chain_id: u64,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> DisperserResult<ConfirmationReceipt> {
        let provider = self.get_provider(chain_id)?;
        self.watcher
            .wait(&provider, tx_hash, confirmations, timeout)
            .await
    }
}
