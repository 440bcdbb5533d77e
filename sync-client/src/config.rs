//! Configuration loading for lanbackup clients.
//!
//! Configuration is loaded from a TOML file (default: `lanbackup.toml`).
//! Every section and key is optional.

use lanbackup_types::{ServiceId, ServiceRecord};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a lanbackup client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Device configuration.
    #[serde(default)]
    pub device: DeviceSettings,
    /// Discovery loop configuration.
    #[serde(default)]
    pub discovery: DiscoverySettings,
    /// Pairing configuration.
    #[serde(default)]
    pub pairing: PairingSettings,
    /// File transfer configuration.
    #[serde(default)]
    pub sync: SyncSettings,
    /// Registry storage configuration.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Servers announced by hand instead of by network discovery.
    #[serde(default)]
    pub servers: Vec<ManualServer>,
}

/// Device configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSettings {
    /// Name shown to servers during pairing (default: "lanbackup client").
    #[serde(default = "default_device_name")]
    pub name: String,
}

/// Discovery loop configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverySettings {
    /// Time between scan cycles in milliseconds (default: 5000).
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Cycles a server may be missing before it is marked offline (default: 1).
    #[serde(default = "default_missed_cycles")]
    pub missed_cycles_before_offline: u32,
}

/// Pairing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PairingSettings {
    /// Upper bound for the key exchange in seconds (default: 30).
    #[serde(default = "default_pairing_timeout_secs")]
    pub timeout_secs: u64,
}

/// File transfer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Plaintext bytes per sealed chunk (default: 256 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Timeout for a single network exchange in seconds (default: 30).
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
}

/// Registry storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Registry file, relative paths resolve against the data directory
    /// (default: "paired_servers.bin").
    #[serde(default = "default_registry_file")]
    pub registry_file: PathBuf,
}

/// A server entered by hand.
#[derive(Debug, Clone, Deserialize)]
pub struct ManualServer {
    /// Server id, hex or hyphenated UUID text.
    pub id: ServiceId,
    /// Server address.
    pub address: IpAddr,
    /// Server port (default: 5354).
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Display name (default: the address).
    #[serde(default)]
    pub name: Option<String>,
}

impl ManualServer {
    /// Convert into the record discovery would have produced.
    pub fn to_record(&self) -> ServiceRecord {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| self.address.to_string());
        ServiceRecord::new(self.id, self.address, self.port, name)
    }
}

// Default value functions
fn default_device_name() -> String {
    "lanbackup client".to_string()
}

fn default_period_ms() -> u64 {
    5_000
}

fn default_missed_cycles() -> u32 {
    1
}

fn default_pairing_timeout_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    256 * 1024 // 256 KiB
}

fn default_io_timeout_secs() -> u64 {
    30
}

fn default_registry_file() -> PathBuf {
    PathBuf::from("paired_servers.bin")
}

fn default_server_port() -> u16 {
    5354
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            name: default_device_name(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            missed_cycles_before_offline: default_missed_cycles(),
        }
    }
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_pairing_timeout_secs(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            registry_file: default_registry_file(),
        }
    }
}

impl DiscoverySettings {
    /// Scan period as a duration.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

impl PairingSettings {
    /// Key exchange timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyncSettings {
    /// Network exchange timeout as a duration.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Records for every manually configured server.
    pub fn manual_records(&self) -> Vec<ServiceRecord> {
        self.servers.iter().map(ManualServer::to_record).collect()
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
