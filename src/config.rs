//! Configuration management for the orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub database: Option<DatabaseConfig>,
    pub order_api: OrderApiConfig,
    pub chains: HashMap<String, ChainConfig>,
    pub wallet: Option<WalletConfig>,
}

/// Timing parameters for the watchers and services
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub order_poll_interval_ms: u64,
    /// How long an order may be missing from the settlement API before its
    /// submission is considered failed
    pub order_submission_buffer_ms: u64,
    pub receipt_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub reconcile_poll_interval_ms: u64,
    pub reconcile_timeout_ms: u64,
    pub submit_timeout_secs: u64,
    pub nonce_reservation_ttl_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            order_poll_interval_ms: 2_000,
            order_submission_buffer_ms: 20_000,
            receipt_timeout_secs: 300,
            receipt_poll_interval_ms: 1_000,
            reconcile_poll_interval_ms: 100,
            reconcile_timeout_ms: 5_000,
            submit_timeout_secs: 30,
            nonce_reservation_ttl_secs: 120,
        }
    }
}

impl OrchestratorConfig {
    pub fn order_poll_interval(&self) -> Duration {
        Duration::from_millis(self.order_poll_interval_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn reconcile_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_poll_interval_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    pub fn nonce_reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_reservation_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    /// Endpoint accepting raw transactions without public mempool exposure
    pub private_rpc_url: Option<String>,
    /// Status lookup for privately relayed transactions, queried as `{url}/{hash}`
    pub private_relay_status_url: Option<String>,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_native_symbol")]
    pub native_currency_symbol: String,
    #[serde(default = "default_native_address")]
    pub native_currency_address: String,
    pub enabled: bool,
}

fn default_native_symbol() -> String {
    "ETH".to_string()
}

fn default_native_address() -> String {
    "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

impl Settings {
    /// Load settings from the file named by `WALLET_TX_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("WALLET_TX_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

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

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        let o = &self.orchestrator;
        if o.order_poll_interval_ms == 0
            || o.receipt_poll_interval_ms == 0
            || o.reconcile_poll_interval_ms == 0
        {
            anyhow::bail!("Polling intervals must be non-zero");
        }

        if self.order_api.base_url.is_empty() {
            anyhow::bail!("order_api.base_url must be set");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
