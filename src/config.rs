//! Daemon configuration: TOML file with per-subsystem sections, created
//! with defaults on first start.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Platform data directory (`~/.tempo` unless overridden).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tempo")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub consensus: ConsensusConfig,
    pub vdf: VdfConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Random identity reported in the heartbeat registry.
    pub id: u64,
    /// Create the genesis block when the store is empty.
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub gossip_port: u16,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_handshake_interval")]
    pub handshake_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled cache size in megabytes.
    pub cache_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Round length in milliseconds.
    pub round_interval_ms: u64,
    /// Grace period after the deadline before the selector may commit.
    pub finish_offset_ms: u64,
    /// Candidates stamped later than deadline + this offset missed their
    /// round.
    pub package_offset_ms: u64,
    /// Fraction of addresses eligible to package (1.0 during bootstrap).
    pub eligibility_threshold: f64,
    pub coinbase_reward: u64,
    pub mempool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdfConfig {
    /// Bit length of a freshly generated genesis modulus.
    pub modulus_bits: u64,
    /// Squaring iterations per round for a fresh genesis.
    pub time_param: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn default_handshake_interval() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "tempo-node".into(),
                id: rand::thread_rng().gen_range(2..=u32::MAX as u64),
                bootstrap: false,
                data_dir: None,
            },
            network: NetworkConfig {
                listen_address: "0.0.0.0:9630".into(),
                gossip_port: 9631,
                bootstrap_peers: Vec::new(),
                handshake_interval_secs: default_handshake_interval(),
            },
            storage: StorageConfig { cache_mb: 64 },
            consensus: ConsensusConfig {
                round_interval_ms: 15_000,
                finish_offset_ms: 10_000,
                package_offset_ms: 13_500,
                eligibility_threshold: 1.0,
                coinbase_reward: 50 * 100_000_000,
                mempool_size: 512,
            },
            vdf: VdfConfig {
                modulus_bits: 1024,
                time_param: 10_000_000,
            },
            logging: LoggingConfig {
                level: "info".into(),
            },
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Read the config, writing a default one on first start.
    pub fn load_or_create(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            return Self::load_from_file(path);
        }
        let config = Self::default();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, toml::to_string_pretty(&config)?)?;
        tracing::info!(path = %path.display(), "Wrote default configuration");
        Ok(config)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.node
            .data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir)
    }
}
