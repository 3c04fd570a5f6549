//! Configuration system for bitswarm.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BITSWARM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/bitswarm/config.toml
//!   3. ~/.config/bitswarm/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BitswarmConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub trust: TrustConfig,
    pub exchange: ExchangeSettings,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// File holding this node's peer id (hex). Generated on first run.
    pub peer_id_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listen address for exchange streams.
    pub listen_addr: String,
    /// Known peers as `<peer-id-hex>@<host:port>`.
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Peer ids (hex) whitelisted from startup.
    pub trusted_peers: Vec<String>,
}

/// Tunables for the exchange engine and content manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    /// Answer inbound want-lists. When false the node only fetches.
    pub engine_enabled: bool,
    /// Reply DONT_HAVE to misses when the requester asked for it.
    pub send_dont_haves: bool,
    /// Blocks at or below this size answer a WANT-HAVE directly.
    pub max_block_size_replace_has_with_block: usize,
    pub provider_refresh_ms: u64,
    pub probe_interval_ms: u64,
    pub provider_workers: usize,
    pub want_workers: usize,
    pub response_workers: usize,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the on-disk block store.
    pub blocks_path: PathBuf,
    /// Keep blocks in memory only.
    pub in_memory: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            peer_id_path: config_dir().join("peer_id"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4710".to_string(),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        Self {
            engine_enabled: true,
            send_dont_haves: false,
            max_block_size_replace_has_with_block: 1024,
            provider_refresh_ms: 30_000,
            probe_interval_ms: 250,
            provider_workers: 8,
            want_workers: 16,
            response_workers: 32,
            connect_timeout_ms: 5_000,
            response_timeout_ms: 10_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blocks_path: data_dir().join("blocks"),
            in_memory: false,
        }
    }
}

impl ExchangeSettings {
    pub fn provider_refresh(&self) -> Duration {
        Duration::from_millis(self.provider_refresh_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("bitswarm")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("bitswarm")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BitswarmConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BitswarmConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BITSWARM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BitswarmConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply BITSWARM_* overrides from `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BITSWARM_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = lookup("BITSWARM_EXCHANGE__SEND_DONT_HAVES") {
            self.exchange.send_dont_haves = v == "true" || v == "1";
        }
        if let Some(v) = lookup("BITSWARM_EXCHANGE__ENGINE_ENABLED") {
            self.exchange.engine_enabled = v == "true" || v == "1";
        }
        if let Some(v) = lookup("BITSWARM_STORAGE__BLOCKS_PATH") {
            self.storage.blocks_path = PathBuf::from(v);
        }
    }
}
