//! Configuration types for the wallet sync service
//!
//! Manages the chain server connection, the network the wallet lives on, address discovery
//! tuning, and where wallet state is kept on disk.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming the JSON configuration file read by the binary
pub const CONFIG_PATH_ENV: &str = "BTC_WALLET_SYNC_CONFIG";

/// Default number of consecutive unused addresses scanned before a chain is considered exhausted
pub const DEFAULT_GAP_LIMIT: u32 = 20;

/// Global wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub node: NodeConfig,
    pub wallet: WalletSection,
}

/// Chain server connection and discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
    pub network: NetworkKind,
    /// Maximum consecutive empty addresses before stopping a chain scan
    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
}

/// Local wallet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSection {
    /// Directory holding the transaction log and address indices
    pub data_dir: PathBuf,
    /// Account-level extended public key (`m/44'/coin'/0'`)
    ///
    /// When absent the binary generates a throwaway seed, which is only useful against regtest.
    #[serde(default)]
    pub account_xpub: Option<String>,
    #[serde(default)]
    pub address_kind: AddressKind,
}

/// Bitcoin network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Main,
    Testnet,
    Regtest,
}

/// Output script type used for derived addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressKind {
    /// Pay-to-pubkey-hash
    #[default]
    Legacy,
    /// Pay-to-witness-pubkey-hash
    SegwitV0,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_gap_limit() -> u32 {
    DEFAULT_GAP_LIMIT
}

impl From<NetworkKind> for bitcoin::Network {
    fn from(kind: NetworkKind) -> Self {
        match kind {
            NetworkKind::Main => bitcoin::Network::Bitcoin,
            NetworkKind::Testnet => bitcoin::Network::Testnet,
            NetworkKind::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl NodeConfig {
    /// Electrum connection URL, `ssl://` or `tcp://` depending on `use_ssl`
    pub fn electrum_url(&self) -> String {
        let scheme = if self.use_ssl { "ssl" } else { "tcp" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

impl WalletConfig {
    /// Create default configuration for a local regtest Electrum server
    pub fn default_regtest() -> Self {
        Self {
            node: NodeConfig {
                host: "127.0.0.1".to_string(),
                port: 50001,
                use_ssl: false,
                network: NetworkKind::Regtest,
                gap_limit: DEFAULT_GAP_LIMIT,
            },
            wallet: WalletSection {
                data_dir: PathBuf::from("./wallet-data/regtest"),
                account_xpub: None,
                address_kind: AddressKind::Legacy,
            },
        }
    }

    /// Create default configuration for testnet
    pub fn default_testnet() -> Self {
        Self {
            node: NodeConfig {
                host: "electrum.blockstream.info".to_string(),
                port: 60002,
                use_ssl: true,
                network: NetworkKind::Testnet,
                gap_limit: DEFAULT_GAP_LIMIT,
            },
            wallet: WalletSection {
                data_dir: PathBuf::from("./wallet-data/testnet"),
                account_xpub: None,
                address_kind: AddressKind::Legacy,
            },
        }
    }

    /// Create default configuration for mainnet
    pub fn default_mainnet() -> Self {
        Self {
            node: NodeConfig {
                host: "electrum.blockstream.info".to_string(),
                port: 50002,
                use_ssl: true,
                network: NetworkKind::Main,
                gap_limit: DEFAULT_GAP_LIMIT,
            },
            wallet: WalletSection {
                data_dir: PathBuf::from("./wallet-data/mainnet"),
                account_xpub: None,
                address_kind: AddressKind::Legacy,
            },
        }
    }

    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: WalletConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the recognized options for values the sync core cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.host.trim().is_empty() {
            return Err(ConfigError::Invalid("node.host must not be empty".into()));
        }
        if self.node.port == 0 {
            return Err(ConfigError::Invalid("node.port must not be 0".into()));
        }
        if self.node.gap_limit < 1 {
            return Err(ConfigError::Invalid(
                "node.gap_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
