//! Application state management

use anyhow::Result;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig};
use rollcall_core::{DeviceCache, NetworkSettings, SettingsStore};
use rollcall_discovery::{DiscoveryService, SystemNeighborTable, SystemPinger};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;

/// Shared application state
pub struct AppState {
    pub service: Arc<DiscoveryService>,
    pub config: Config,
}

impl AppState {
    /// Open the cache and settings store and wire up the discovery service
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let cache = Arc::new(DeviceCache::open(&config.storage.cache_path));
        let stats = cache.stats();
        info!(
            path = %config.storage.cache_path,
            devices = stats.total_devices,
            networks = stats.total_networks,
            "Device cache loaded"
        );

        let defaults = default_network_settings();
        let settings = Arc::new(SettingsStore::open(&config.storage.settings_path, defaults));

        let service = DiscoveryService::new(
            cache,
            settings,
            Arc::new(SystemPinger),
            Arc::new(SystemNeighborTable::new(config.discovery.neighbor_timeout())),
            config.to_service_options(),
        );

        Ok(Arc::new(Self {
            service: Arc::new(service),
            config,
        }))
    }
}

/// Settings covering the `/24` of the first usable IPv4 interface
pub fn default_network_settings() -> NetworkSettings {
    match primary_ipv4() {
        Some(ip) => {
            debug!(ip = %ip, "Deriving default scan range from interface");
            NetworkSettings::for_subnet_of(ip)
        }
        None => NetworkSettings::default(),
    }
}

fn primary_ipv4() -> Option<Ipv4Addr> {
    NetworkInterface::show()
        .unwrap_or_default()
        .into_iter()
        .filter(|iface| {
            // Skip loopback and container bridges
            !iface.name.starts_with("lo")
                && !iface.name.starts_with("docker")
                && !iface.name.starts_with("br-")
                && !iface.name.starts_with("veth")
        })
        .find_map(|iface| {
            iface.addr.iter().find_map(|addr| match addr {
                Addr::V4(v4) if !v4.ip.is_loopback() && !v4.ip.is_link_local() => Some(v4.ip),
                _ => None,
            })
        })
}
