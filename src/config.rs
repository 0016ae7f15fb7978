//! Configuration management for the disperser
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::error::{DisperserError, DisperserResult};

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub dispersal: DispersalConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispersalConfig {
    /// Block depth a dispersal transaction needs before it counts as confirmed
    pub confirmations: u64,
    pub confirmation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Decimals of the deposited token (USDC = 6)
    pub token_decimals: u32,
    pub fee_bump_percent: u64,
    pub gas_limit: u64,
    pub merge_retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
}

impl Default for DispersalConfig {
    fn default() -> Self {
        Self {
            confirmations: 1,
            confirmation_timeout_secs: 600,
            poll_interval_ms: 2_000,
            token_decimals: 6,
            fee_bump_percent: 25,
            gas_limit: 750_000,
            merge_retry_delay_ms: 50,
            health_check_interval_secs: 30,
        }
    }
}

impl DispersalConfig {
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Read-merge-write attempts before a patch reports a conflict
    pub max_patch_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            max_patch_attempts: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Name of the environment variable holding the distributor key
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "DISTRIBUTOR_PRIVATE_KEY".to_string(),
        }
    }
}

impl WalletConfig {
    /// Read the distributor private key, if one is set
    pub fn private_key(&self) -> Option<String> {
        env::var(&self.private_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    /// Escrow contract exposing `drip`
    pub contract_address: String,
    pub explorer_url: String,
    pub native_symbol: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ChainConfig {
    pub fn contract(&self) -> DisperserResult<Address> {
        self.contract_address.parse().map_err(|e| {
            DisperserError::Config(format!(
                "Invalid contract address for chain {}: {}",
                self.chain_id, e
            ))
        })
    }

    /// Explorer link for a transaction hash
    pub fn explorer_tx_url(&self, tx_hash: &str) -> String {
        format!("{}/tx/{}", self.explorer_url.trim_end_matches('/'), tx_hash)
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("DISPERSER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let mut seen = HashMap::new();
        for (name, chain) in self.enabled_chains() {
            if let Some(other) = seen.insert(chain.chain_id, name) {
                anyhow::bail!(
                    "Chain id {} configured twice ({} and {})",
                    chain.chain_id,
                    other,
                    name
                );
            }
            if chain.rpc_url.is_empty() {
                anyhow::bail!("Chain {} has no RPC URL configured", name);
            }
            chain
                .contract()
                .with_context(|| format!("Chain {} has an unusable contract address", name))?;
        }

        if self.store.backend == StoreBackend::Postgres && self.database.is_none() {
            anyhow::bail!("Postgres store backend requires a [database] section");
        }

        if self.dispersal.poll_interval_ms == 0 {
            anyhow::bail!("dispersal.poll_interval_ms must be greater than zero");
        }

        if self.dispersal.confirmation_timeout_secs == 0 {
            anyhow::bail!("dispersal.confirmation_timeout_secs must be greater than zero");
        }

        if self.store.max_patch_attempts == 0 {
            anyhow::bail!("store.max_patch_attempts must be at least 1");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Build the destination chain registry from enabled chains
    pub fn chain_registry(&self) -> ChainRegistry {
        ChainRegistry::new(self.enabled_chains().into_iter().map(|(_, c)| c.clone()))
    }
}

/// Destination chain registry keyed by chain id
#[derive(Debug, Clone, Default)]
pub struct ChainRegistry {
    chains: HashMap<u64, ChainConfig>,
}

impl ChainRegistry {
    pub fn new(chains: impl IntoIterator<Item = ChainConfig>) -> Self {
        Self {
            chains: chains.into_iter().map(|c| (c.chain_id, c)).collect(),
        }
    }

    /// Look up a chain; absence is a hard configuration error
    pub fn get(&self, chain_id: u64) -> DisperserResult<&ChainConfig> {
        self.chains
            .get(&chain_id)
            .ok_or(DisperserError::ChainNotFound { chain_id })
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[dispersal]
confirmations = 2
confirmation_timeout_secs = 300

[api]
host = "127.0.0.1"
port = 3000

[metrics]
enabled = false
port = 9090

[chains.optimism]
chain_id = 10
name = "Optimism"
rpc_url = "${DISPERSER_TEST_OP_RPC}"
contract_address = "0x839eaf1fe9fc3d46309893f5ec4c2c289783f991"
explorer_url = "https://optimistic.etherscan.io"
native_symbol = "ETH"

[chains.polygon]
chain_id = 137
name = "Polygon"
rpc_url = "https://polygon-rpc.com"
contract_address = "0x839eaf1fe9fc3d46309893f5ec4c2c289783f991"
explorer_url = "https://polygonscan.com/"
native_symbol = "POL"
enabled = false
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("DISPERSER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${DISPERSER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_load_settings_with_defaults() {
        env::set_var("DISPERSER_TEST_OP_RPC", "https://mainnet.optimism.io");
        let file = write_config(SAMPLE);
        let settings = Settings::load_from(file.path()).unwrap();

        assert_eq!(settings.dispersal.confirmations, 2);
        assert_eq!(settings.dispersal.token_decimals, 6);
        assert_eq!(settings.dispersal.fee_bump_percent, 25);
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.wallet.private_key_env, "DISTRIBUTOR_PRIVATE_KEY");

        let registry = settings.chain_registry();
        assert_eq!(registry.chain_ids(), vec![10]);
        assert_eq!(
            registry.get(10).unwrap().rpc_url,
            "https://mainnet.optimism.io"
        );
        assert!(matches!(
            registry.get(137),
            Err(DisperserError::ChainNotFound { chain_id: 137 })
        ));
    }

    #[test]
    fn test_postgres_backend_requires_database() {
        env::set_var("DISPERSER_TEST_OP_RPC", "https://mainnet.optimism.io");
        let contents = format!("[store]\nbackend = \"postgres\"\n{}", SAMPLE);
        let file = write_config(&contents);
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("[database]"));
    }

    #[test]
    fn test_zero_polling_settings_rejected() {
        env::set_var("DISPERSER_TEST_OP_RPC", "https://mainnet.optimism.io");

        let zero_poll = SAMPLE.replace(
            "confirmation_timeout_secs = 300",
            "confirmation_timeout_secs = 300\npoll_interval_ms = 0",
        );
        let file = write_config(&zero_poll);
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));

        let zero_timeout = SAMPLE.replace(
            "confirmation_timeout_secs = 300",
            "confirmation_timeout_secs = 0",
        );
        let file = write_config(&zero_timeout);
        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("confirmation_timeout_secs"));
    }

    #[test]
    fn test_explorer_url_trims_trailing_slash() {
        let chain = ChainConfig {
            chain_id: 137,
            name: "Polygon".to_string(),
            rpc_url: "https://polygon-rpc.com".to_string(),
            contract_address: "0x839eaf1fe9fc3d46309893f5ec4c2c289783f991".to_string(),
            explorer_url: "https://polygonscan.com/".to_string(),
            native_symbol: "POL".to_string(),
            enabled: true,
        };
        assert_eq!(
            chain.explorer_tx_url("0xabc"),
            "https://polygonscan.com/tx/0xabc"
        );
    }
}
