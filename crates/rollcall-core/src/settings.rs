//! Persisted network settings used by DHCP-range discovery

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::net::{IpRange, RangeError};

pub const MIN_SCAN_TIMEOUT_SECS: u64 = 1;
pub const MAX_SCAN_TIMEOUT_SECS: u64 = 10;
pub const MAX_CONCURRENT_SCANS: usize = 256;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid IP range: {0}")]
    InvalidRange(#[from] RangeError),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Range, timeout and concurrency for a discovery sweep
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub ip_range_start: String,
    pub ip_range_end: String,
    /// Per-probe timeout in seconds
    pub scan_timeout: u64,
    /// Worker pool size
    pub concurrent_scans: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self::for_subnet_of(Ipv4Addr::new(192, 168, 1, 1))
    }
}

impl NetworkSettings {
    /// Defaults covering `.1`-`.254` of the `/24` that holds `ip`
    pub fn for_subnet_of(ip: Ipv4Addr) -> Self {
        let [a, b, c, _] = ip.octets();
        Self {
            ip_range_start: Ipv4Addr::new(a, b, c, 1).to_string(),
            ip_range_end: Ipv4Addr::new(a, b, c, 254).to_string(),
            scan_timeout: 1,
            concurrent_scans: 50,
        }
    }

    /// Parse the configured range
    pub fn range(&self) -> Result<IpRange, RangeError> {
        IpRange::parse(&self.ip_range_start, &self.ip_range_end)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout)
    }

    /// Check range, timeout and concurrency bounds
    pub fn validate(&self) -> Result<IpRange, SettingsError> {
        let range = self.range()?;
        if !(MIN_SCAN_TIMEOUT_SECS..=MAX_SCAN_TIMEOUT_SECS).contains(&self.scan_timeout) {
            return Err(SettingsError::Invalid(format!(
                "scan_timeout must be between {} and {} seconds",
                MIN_SCAN_TIMEOUT_SECS, MAX_SCAN_TIMEOUT_SECS
            )));
        }
        if !(1..=MAX_CONCURRENT_SCANS).contains(&self.concurrent_scans) {
            return Err(SettingsError::Invalid(format!(
                "concurrent_scans must be between 1 and {}",
                MAX_CONCURRENT_SCANS
            )));
        }
        Ok(range)
    }
}

/// File-backed holder of the current [`NetworkSettings`]
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<NetworkSettings>,
}

impl SettingsStore {
    /// Load settings from `path`, using `defaults` when the file is missing,
    /// unreadable or invalid.
    pub fn open(path: impl Into<PathBuf>, defaults: NetworkSettings) -> Self {
        let path = path.into();
        let current = load_settings(&path).unwrap_or_else(|| defaults.clone());
        Self {
            path,
            current: Mutex::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, NetworkSettings> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> NetworkSettings {
        self.lock().clone()
    }

    /// Validate, persist and apply new settings
    pub fn update(&self, settings: NetworkSettings) -> Result<NetworkSettings, SettingsError> {
        settings.validate()?;
        let mut current = self.lock();

        let content = serde_json::to_string_pretty(&settings)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(content.as_bytes())?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        info!(
            start = %settings.ip_range_start,
            end = %settings.ip_range_end,
            timeout = settings.scan_timeout,
            concurrency = settings.concurrent_scans,
            "Network settings updated"
        );
        *current = settings.clone();
        Ok(settings)
    }
}

fn load_settings(path: &Path) -> Option<NetworkSettings> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "Network settings not found, using defaults");
            return None;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read network settings, using defaults");
            return None;
        }
    };

    let settings: NetworkSettings = match serde_json::from_str(&content) {
        Ok(settings) => settings,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Network settings are corrupt, using defaults");
            return None;
        }
    };

    match settings.validate() {
        Ok(_) => Some(settings),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Network settings are invalid, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_for_subnet() {
        let settings = NetworkSettings::for_subnet_of(Ipv4Addr::new(10, 20, 30, 40));
        assert_eq!(settings.ip_range_start, "10.20.30.1");
        assert_eq!(settings.ip_range_end, "10.20.30.254");
        assert_eq!(settings.validate().unwrap().len(), 254);
    }

    #[test]
    fn test_validate_bounds() {
        let mut settings = NetworkSettings::default();
        settings.scan_timeout = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));

        let mut settings = NetworkSettings::default();
        settings.concurrent_scans = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));

        let mut settings = NetworkSettings::default();
        settings.ip_range_start = "192.168.1.200".to_string();
        settings.ip_range_end = "192.168.1.100".to_string();
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidRange(_))));
    }

    #[test]
    fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("network_settings.json");
        let store = SettingsStore::open(&path, NetworkSettings::default());

        let mut settings = store.get();
        settings.concurrent_scans = 20;
        store.update(settings.clone()).unwrap();

        let reopened = SettingsStore::open(&path, NetworkSettings::default());
        assert_eq!(reopened.get(), settings);
    }

    #[test]
    fn test_invalid_update_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::open(dir.path().join("s.json"), NetworkSettings::default());
        let mut settings = store.get();
        settings.ip_range_end = "nope".to_string();
        assert!(store.update(settings).is_err());
        assert_eq!(store.get(), NetworkSettings::default());
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("network_settings.json");
        fs::write(&path, "").unwrap();
        let defaults = NetworkSettings::for_subnet_of(Ipv4Addr::new(172, 16, 5, 1));
        let store = SettingsStore::open(&path, defaults.clone());
        assert_eq!(store.get(), defaults);
    }
}
