//! Configuration loading

use anyhow::Result;
use rollcall_discovery::{ScannerConfig, ServiceOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the API server
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8090".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Device cache file
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    /// Network settings file used by DHCP discovery
    #[serde(default = "default_settings_path")]
    pub settings_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            settings_path: default_settings_path(),
        }
    }
}

fn default_cache_path() -> String {
    "./data/device_cache.json".to_string()
}

fn default_settings_path() -> String {
    "./data/network_settings.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Addresses probed between progress updates
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Echo requests sent by a single-device ping
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    /// Timeout for reading the neighbor table
    #[serde(default = "default_neighbor_timeout_ms")]
    pub neighbor_timeout_ms: u64,
    /// How long finished sessions stay queryable
    #[serde(default = "default_session_retention")]
    pub session_retention_secs: u64,
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    /// Report online hosts without a MAC in DHCP sweeps
    #[serde(default = "default_true")]
    pub include_unidentified: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            ping_count: default_ping_count(),
            neighbor_timeout_ms: default_neighbor_timeout_ms(),
            session_retention_secs: default_session_retention(),
            reaper_interval_secs: default_reaper_interval(),
            include_unidentified: true,
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_ping_count() -> u32 {
    3
}

fn default_neighbor_timeout_ms() -> u64 {
    5000
}

fn default_session_retention() -> u64 {
    300
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl DiscoveryConfig {
    pub fn neighbor_timeout(&self) -> Duration {
        Duration::from_millis(self.neighbor_timeout_ms)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

impl Config {
    /// Convert to discovery service options
    pub fn to_service_options(&self) -> ServiceOptions {
        ServiceOptions {
            scanner: ScannerConfig {
                batch_size: self.discovery.batch_size.max(1),
                include_unidentified: self.discovery.include_unidentified,
                ..ScannerConfig::default()
            },
            ping_count: self.discovery.ping_count.max(1),
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
