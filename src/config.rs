//! Configuration module

use crate::types::{Metric, SEPOLIA_CHAIN_ID};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chain configurations, keyed by chain id
    pub chains: HashMap<u64, ChainConfig>,

    /// Contract interface descriptors
    pub interfaces: InterfaceConfig,

    /// Wallet provider settings
    pub wallet: WalletConfig,

    /// Read-model polling settings
    pub polling: PollingConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub staking_address: Option<String>,
    pub stake_token_address: Option<String>,
    /// Read from the token's `decimals()` when unset
    pub token_decimals: Option<u8>,
}

impl ChainConfig {
    /// Both contract addresses, if this chain has a deployment
    pub fn deployment(&self) -> Option<(&str, &str)> {
        match (&self.staking_address, &self.stake_token_address) {
            (Some(staking), Some(token)) => Some((staking.as_str(), token.as_str())),
            _ => None,
        }
    }
}

/// Human-readable Solidity signatures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub staking: Vec<String>,
    pub stake_token: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Local signer key; remote accounts (`eth_requestAccounts`) are used when unset
    pub private_key: Option<String>,
    pub event_poll_interval_ms: u64,
    pub confirmation_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    pub interval_ms: u64,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json_output: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            staking: vec![
                "function stake(uint256 amount)".to_string(),
                "function withdrawStakedTokens(uint256 amount)".to_string(),
                "function getReward()".to_string(),
                "function earned(address account) view returns (uint256)".to_string(),
                "function stakedBalance(address account) view returns (uint256)".to_string(),
                "function REWARD_RATE() view returns (uint256)".to_string(),
            ],
            stake_token: vec![
                "function approve(address spender, uint256 amount) returns (bool)".to_string(),
                "function allowance(address owner, address spender) view returns (uint256)"
                    .to_string(),
                "function balanceOf(address account) view returns (uint256)".to_string(),
                "function decimals() view returns (uint8)".to_string(),
            ],
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut chains = HashMap::new();

        chains.insert(SEPOLIA_CHAIN_ID, ChainConfig {
            name: "Sepolia".to_string(),
            chain_id: SEPOLIA_CHAIN_ID,
            rpc_url: "https://rpc.sepolia.org".to_string(),
            staking_address: None,
            stake_token_address: None,
            token_decimals: None,
        });

        Self {
            chains,
            interfaces: InterfaceConfig::default(),
            wallet: WalletConfig {
                private_key: None,
                event_poll_interval_ms: 2_000,
                confirmation_poll_interval_ms: 1_000,
            },
            polling: PollingConfig {
                interval_ms: 20_000,
                metrics: Metric::all(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json_output: false,
            },
        }
    }
}

impl Config {
    /// Load config from environment
    pub fn from_env() -> anyhow::Result<Self> {
        // Try to load from file first
        let config_path = std::env::var("STAKING_CONFIG")
            .unwrap_or_else(|_| "config/config.json".to_string());

        let mut config = if std::path::Path::new(&config_path).exists() {
            let content = std::fs::read_to_string(&config_path)?;
            serde_json::from_str::<Config>(&content)?
        } else {
            Config::default()
        };

        if let Ok(key) = std::env::var("STAKING_PRIVATE_KEY") {
            config.wallet.private_key = Some(key);
        }
        if let Ok(url) = std::env::var("STAKING_RPC_URL") {
            for chain in config.chains.values_mut() {
                chain.rpc_url = url.clone();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the session cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("at least one chain must be configured");
        }
        for (id, chain) in &self.chains {
            if *id != chain.chain_id {
                anyhow::bail!("chain entry {} declares chain_id {}", id, chain.chain_id);
            }
        }
        if self.polling.interval_ms == 0 {
            anyhow::bail!("polling.interval_ms must be positive");
        }
        Ok(())
    }

    /// Save config to file
    pub fn save(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn chain(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.get(&chain_id)
    }

    /// Register a deployment, creating the chain entry if needed
    pub fn with_deployment(
        mut self,
        chain_id: u64,
        staking_address: &str,
        stake_token_address: &str,
    ) -> Self {
        let chain = self.chains.entry(chain_id).or_insert_with(|| ChainConfig {
            name: format!("chain-{}", chain_id),
            chain_id,
            rpc_url: String::new(),
            staking_address: None,
            stake_token_address: None,
            token_decimals: None,
        });
        chain.staking_address = Some(staking_address.to_string());
        chain.stake_token_address = Some(stake_token_address.to_string());
        self
    }
}
