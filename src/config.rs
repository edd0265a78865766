//! Node configuration
//!
//! A `NodeConfig` comes from defaults, optionally overlaid by a JSON file;
//! command-line flags override both.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::mining::CpuMiningBackend;
use crate::network::NodeType;
use crate::storage::StorageConfig;

pub const DEFAULT_PORT: u16 = 9900;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Role a node announces to its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Miner,
    Wallet,
}

impl From<NodeRole> for NodeType {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Miner => NodeType::MINER,
            NodeRole::Wallet => NodeType::WALLET,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub port: u16,
    /// `host:port` peers tried at startup
    pub bootstrap_peers: Vec<String>,
    pub data_dir: PathBuf,
    /// Wallet file, relative to `data_dir` unless absolute
    pub wallet_file: PathBuf,
    /// Keep an HD seed in the wallet file instead of a single private key
    pub hd_wallet: bool,
    pub chain_file: String,
    /// 0 picks a count from the hardware
    pub mining_threads: usize,
    pub node_type: NodeRole,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bootstrap_peers: (DEFAULT_PORT..DEFAULT_PORT + 5)
                .map(|port| format!("127.0.0.1:{}", port))
                .collect(),
            data_dir: PathBuf::from(".tinycoin"),
            wallet_file: PathBuf::from("wallet.dat"),
            hd_wallet: false,
            chain_file: "chain.dat".to_string(),
            mining_threads: 0,
            node_type: NodeRole::Miner,
        }
    }
}

impl NodeConfig {
    /// Read a JSON config; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config = serde_json::from_str(&data)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(&self.wallet_file)
    }

    pub fn mining_threads(&self) -> usize {
        match self.mining_threads {
            0 => CpuMiningBackend::default_thread_count(),
            n => n,
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            data_dir: self.data_dir.clone(),
            chain_file: self.chain_file.clone(),
            ..Default::default()
        }
    }
}
