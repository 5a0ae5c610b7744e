//! CLI configuration file
//!
//! ```toml
//! [device]
//! name = "laptop"
//!
//! [network]
//! port = 24242
//! connect_timeout_secs = 10
//! accept_timeout_secs = 0
//!
//! [transfer]
//! output_dir = "/home/me/Downloads/FlickShare"
//! buffer_size = 65536
//! progress_interval = 524288
//!
//! [discovery]
//! resolve_timeout_secs = 5
//! status_capacity = 64
//! ```

use anyhow::Context;
use flick_core::{
    DEFAULT_BUFFER_SIZE, DEFAULT_PORT, DEFAULT_PROGRESS_INTERVAL, DEFAULT_STATUS_CAPACITY,
};
use flick_discovery::MdnsConfig;
use flick_files::IncomingDir;
use flick_transport::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys accepted by `flick config show|set`
pub const KEYS: &[&str] = &[
    "device.name",
    "network.port",
    "network.connect_timeout_secs",
    "network.accept_timeout_secs",
    "transfer.output_dir",
    "transfer.buffer_size",
    "transfer.progress_interval",
    "discovery.resolve_timeout_secs",
    "discovery.status_capacity",
];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How this device presents itself
    pub device: DeviceConfig,
    /// Ports and timeouts
    pub network: NetworkConfig,
    /// Where files go and how they are copied
    pub transfer: TransferConfig,
    /// Discovery tuning
    pub discovery: DiscoveryConfig,
}

/// `[device]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name used in the advertised service name
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Flick device".to_string());
        Self { name }
    }
}

/// `[network]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port the sender listens on
    pub port: u16,
    /// Receiver connect deadline
    pub connect_timeout_secs: u64,
    /// Sender wait for a peer; 0 waits until cancelled
    pub accept_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout_secs: 10,
            accept_timeout_secs: 0,
        }
    }
}

/// `[transfer]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Directory received files are saved in
    pub output_dir: PathBuf,
    /// Copy buffer size in bytes
    pub buffer_size: usize,
    /// Bytes between two progress reports
    pub progress_interval: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            output_dir: IncomingDir::default_root(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

/// `[discovery]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Longest a resolve may take
    pub resolve_timeout_secs: u64,
    /// Status channel capacity
    pub status_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            resolve_timeout_secs: 5,
            status_capacity: DEFAULT_STATUS_CAPACITY,
        }
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {key}: {value}"))
}

impl Config {
    /// `~/.config/flick/config.toml`
    pub fn default_path() -> PathBuf {
        expand_path("~/.config/flick/config.toml")
    }

    /// Load from `path`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Load the default file, or defaults when it does not exist
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    /// Reject values the transfer cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.device.name.trim().is_empty() {
            anyhow::bail!("device.name must not be empty");
        }
        if self.network.port == 0 {
            anyhow::bail!("network.port must not be 0");
        }
        if self.transfer.progress_interval == 0 {
            anyhow::bail!("transfer.progress_interval must be greater than 0");
        }
        if self.discovery.status_capacity == 0 {
            anyhow::bail!("discovery.status_capacity must be greater than 0");
        }
        self.engine_config().validate()?;
        Ok(())
    }

    /// Value of a dotted key, rendered as text
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let value = match key.to_lowercase().as_str() {
            "device.name" => self.device.name.clone(),
            "network.port" => self.network.port.to_string(),
            "network.connect_timeout_secs" => self.network.connect_timeout_secs.to_string(),
            "network.accept_timeout_secs" => self.network.accept_timeout_secs.to_string(),
            "transfer.output_dir" => self.transfer.output_dir.display().to_string(),
            "transfer.buffer_size" => self.transfer.buffer_size.to_string(),
            "transfer.progress_interval" => self.transfer.progress_interval.to_string(),
            "discovery.resolve_timeout_secs" => self.discovery.resolve_timeout_secs.to_string(),
            "discovery.status_capacity" => self.discovery.status_capacity.to_string(),
            _ => anyhow::bail!("Unknown configuration key: {key}"),
        };
        Ok(value)
    }

    /// Set a dotted key from text
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key.to_lowercase().as_str() {
            "device.name" => self.device.name = value.to_string(),
            "network.port" => self.network.port = parse(key, value)?,
            "network.connect_timeout_secs" => self.network.connect_timeout_secs = parse(key, value)?,
            "network.accept_timeout_secs" => self.network.accept_timeout_secs = parse(key, value)?,
            "transfer.output_dir" => self.transfer.output_dir = expand_path(value),
            "transfer.buffer_size" => self.transfer.buffer_size = parse(key, value)?,
            "transfer.progress_interval" => self.transfer.progress_interval = parse(key, value)?,
            "discovery.resolve_timeout_secs" => {
                self.discovery.resolve_timeout_secs = parse(key, value)?;
            }
            "discovery.status_capacity" => self.discovery.status_capacity = parse(key, value)?,
            _ => anyhow::bail!("Unknown configuration key: {key}"),
        }
        Ok(())
    }

    /// Engine settings derived from `[network]` and `[transfer]`
    pub fn engine_config(&self) -> EngineConfig {
        let accept_timeout = match self.network.accept_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        EngineConfig {
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            accept_timeout,
            buffer_size: self.transfer.buffer_size,
            progress_interval: self.transfer.progress_interval,
            ..EngineConfig::default()
        }
    }

    /// Discovery settings derived from `[discovery]`
    pub fn mdns_config(&self) -> MdnsConfig {
        MdnsConfig::default()
            .with_resolve_timeout(Duration::from_secs(self.discovery.resolve_timeout_secs))
    }
}
