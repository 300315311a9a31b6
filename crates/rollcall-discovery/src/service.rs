//! Discovery service: the operations exposed to the daemon
//!
//! Owns the session registry and orchestrator, and wraps the cache,
//! settings store, prober and neighbor source behind one facade.

use rollcall_core::device::{placeholder_hostname, DeviceRecord, DiscoveryMethod};
use rollcall_core::filter::{parse_device_ip, valid_mac};
use rollcall_core::{CacheMetadata, DeviceCache, DeviceKey, NetworkSettings, SettingsStore};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::arp::{NeighborSource, NeighborTable};
use crate::error::{DiscoveryError, Result};
use crate::probe::Prober;
use crate::scanner::{ScanOrchestrator, ScanRequest, ScannerConfig};
use crate::session::{DiscoverySession, ScanMode, SessionRegistry};

/// Echo requests per single-device ping
pub const DEFAULT_PING_COUNT: u32 = 3;

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub scanner: ScannerConfig,
    pub ping_count: u32,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            scanner: ScannerConfig::default(),
            ping_count: DEFAULT_PING_COUNT,
        }
    }
}

/// Result of pinging one device
#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub ip_address: Ipv4Addr,
    pub online: bool,
    pub hostname: String,
    pub mac_address: Option<String>,
    pub response_time_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub message: String,
    /// Cached record for the device, if any
    pub device_info: Option<DeviceRecord>,
}

/// One neighbor-table pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArpPair {
    pub ip: Ipv4Addr,
    pub mac: String,
}

pub struct DiscoveryService {
    cache: Arc<DeviceCache>,
    settings: Arc<SettingsStore>,
    sessions: Arc<SessionRegistry>,
    prober: Arc<dyn Prober>,
    neighbors: Arc<dyn NeighborSource>,
    orchestrator: Arc<ScanOrchestrator>,
    ping_count: u32,
}

impl DiscoveryService {
    pub fn new(
        cache: Arc<DeviceCache>,
        settings: Arc<SettingsStore>,
        prober: Arc<dyn Prober>,
        neighbors: Arc<dyn NeighborSource>,
        options: ServiceOptions,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new());
        let orchestrator = Arc::new(ScanOrchestrator::new(
            Arc::clone(&cache),
            Arc::clone(&sessions),
            Arc::clone(&prober),
            Arc::clone(&neighbors),
            options.scanner,
        ));

        Self {
            cache,
            settings,
            sessions,
            prober,
            neighbors,
            orchestrator,
            ping_count: options.ping_count.max(1),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    /// Validate the parameters and start a static-range session.
    ///
    /// Nothing is created when validation fails.
    pub fn start_static_discovery(
        &self,
        ip_range_start: &str,
        ip_range_end: &str,
        scan_timeout: u64,
        concurrent_scans: usize,
    ) -> Result<String> {
        let settings = NetworkSettings {
            ip_range_start: ip_range_start.trim().to_string(),
            ip_range_end: ip_range_end.trim().to_string(),
            scan_timeout,
            concurrent_scans,
        };
        let request = ScanRequest::from_settings(ScanMode::Static, &settings)?;
        let id = self.orchestrator.start(request);
        info!(session = %id, start = %settings.ip_range_start, end = %settings.ip_range_end, "Static discovery started");
        Ok(id)
    }

    /// Start a DHCP-mode session over the persisted network settings
    pub fn start_dhcp_discovery(&self) -> Result<String> {
        let settings = self.settings.get();
        let request = ScanRequest::from_settings(ScanMode::Dhcp, &settings)?;
        let id = self.orchestrator.start(request);
        info!(session = %id, start = %settings.ip_range_start, end = %settings.ip_range_end, "DHCP discovery started");
        Ok(id)
    }

    pub fn progress(&self, session_id: &str) -> Result<DiscoverySession> {
        self.sessions
            .get(session_id)
            .ok_or_else(|| DiscoveryError::SessionNotFound(session_id.to_string()))
    }

    pub fn cancel(&self, session_id: &str) -> Result<()> {
        if self.sessions.cancel(session_id) {
            Ok(())
        } else {
            Err(DiscoveryError::SessionNotFound(session_id.to_string()))
        }
    }

    /// Ping one device and refresh its cache entry when it answers
    pub async fn ping_device(&self, ip: &str) -> Result<PingReport> {
        let ip = parse_device_ip(ip).ok_or_else(|| DiscoveryError::InvalidAddress(ip.to_string()))?;
        let timeout = self.settings.get().timeout();

        let probe = self.prober.probe(ip, timeout, self.ping_count).await;
        let resolved = if probe.online {
            self.prober.resolve_hostname(ip).await
        } else {
            None
        };

        let neighbors = self.read_neighbors_lenient().await;
        let mac = neighbors
            .get(&ip)
            .map(|entry| entry.mac.clone())
            .or_else(|| {
                self.cache
                    .get_device_info(ip)
                    .and_then(|cached| valid_mac(&cached.mac_address))
            });

        if probe.online {
            if let Some(mac) = &mac {
                let mut record = DeviceRecord::new(ip, mac.clone(), DiscoveryMethod::NetworkScan);
                if let Some(name) = &resolved {
                    record.hostname = name.clone();
                }
                if let Err(e) = self.cache.update_device_info(ip, record) {
                    warn!(ip = %ip, error = %e, "Failed to refresh cached device");
                }
            }
        }

        let device_info = match &mac {
            Some(mac) => self.cache.get_device_by_mac(mac),
            None => self.cache.get_device_info(ip),
        };
        let hostname = resolved
            .or_else(|| device_info.as_ref().map(|d| d.hostname.clone()))
            .unwrap_or_else(|| placeholder_hostname(ip));

        debug!(ip = %ip, online = probe.online, "Ping finished");
        Ok(PingReport {
            ip_address: ip,
            online: probe.online,
            hostname,
            mac_address: mac,
            response_time_ms: probe.response_time_ms,
            packet_loss_pct: probe.packet_loss_pct,
            message: probe.message,
            device_info,
        })
    }

    /// Label a device by IP or MAC.
    ///
    /// A device missing from the cache is created from the neighbor table
    /// when the table knows it.
    pub async fn save_device_name(
        &self,
        ip_or_mac: &str,
        custom_name: Option<String>,
        device_type: Option<String>,
    ) -> Result<DeviceRecord> {
        let key = DeviceKey::parse(ip_or_mac)
            .ok_or_else(|| DiscoveryError::InvalidAddress(ip_or_mac.to_string()))?;

        if let Some(record) = self
            .cache
            .set_custom_name(&key, custom_name.clone(), device_type.clone())?
        {
            info!(ip = %record.ip_address, mac = %record.mac_address, name = ?record.custom_name, "Device name saved");
            return Ok(record);
        }

        let neighbors = self.read_neighbors_lenient().await;
        let entry = match &key {
            DeviceKey::Ip(ip) => neighbors.get(ip),
            DeviceKey::Mac(mac) => neighbors.values().find(|entry| &entry.mac == mac),
        }
        .ok_or_else(|| DiscoveryError::DeviceNotFound(ip_or_mac.to_string()))?;

        let record = DeviceRecord::new(entry.ip, entry.mac.clone(), DiscoveryMethod::Arp);
        if !self.cache.update_device_info(entry.ip, record)? {
            return Err(DiscoveryError::DeviceNotFound(ip_or_mac.to_string()));
        }

        let record = self
            .cache
            .set_custom_name(&DeviceKey::Mac(entry.mac.clone()), custom_name, device_type)?
            .ok_or_else(|| DiscoveryError::DeviceNotFound(ip_or_mac.to_string()))?;
        info!(ip = %record.ip_address, mac = %record.mac_address, name = ?record.custom_name, "Device name saved");
        Ok(record)
    }

    pub fn cached_devices(&self) -> Vec<DeviceRecord> {
        self.cache.all_devices()
    }

    /// Read the neighbor table now; pairs are sorted by IP
    pub async fn refresh_arp_table(&self) -> Result<Vec<ArpPair>> {
        let table = self
            .neighbors
            .read_neighbor_table()
            .await
            .map_err(|e| DiscoveryError::Command(format!("{:#}", e)))?;

        let mut pairs: Vec<ArpPair> = table
            .into_values()
            .map(|entry| ArpPair {
                ip: entry.ip,
                mac: entry.mac,
            })
            .collect();
        pairs.sort_by_key(|pair| pair.ip);
        Ok(pairs)
    }

    pub fn network_settings(&self) -> NetworkSettings {
        self.settings.get()
    }

    pub fn update_network_settings(&self, settings: NetworkSettings) -> Result<NetworkSettings> {
        Ok(self.settings.update(settings)?)
    }

    pub fn cleanup_cache(&self) -> Result<usize> {
        Ok(self.cache.cleanup_invalid_devices()?)
    }

    pub fn cache_stats(&self) -> CacheMetadata {
        self.cache.stats()
    }

    /// Spawn the background task that drops expired sessions
    pub fn spawn_session_reaper(&self, retention: Duration, every: Duration) -> tokio::task::JoinHandle<()> {
        self.sessions.spawn_reaper(retention, every)
    }

    async fn read_neighbors_lenient(&self) -> NeighborTable {
        match self.neighbors.read_neighbor_table().await {
            Ok(table) => table,
            Err(e) => {
                warn!(error = %e, "Neighbor table unavailable");
                NeighborTable::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::NeighborState;
    use crate::session::SessionStatus;
    use crate::testing::{wait_for_terminal, FakeNeighbors, FakeProber};
    use tempfile::TempDir;

    fn service(dir: &TempDir, prober: FakeProber, neighbors: FakeNeighbors) -> DiscoveryService {
        let defaults = NetworkSettings::for_subnet_of(Ipv4Addr::new(10, 0, 0, 1));
        DiscoveryService::new(
            Arc::new(DeviceCache::open(dir.path().join("device_cache.json"))),
            Arc::new(SettingsStore::open(dir.path().join("network_settings.json"), defaults)),
            Arc::new(prober),
            Arc::new(neighbors),
            ServiceOptions::default(),
        )
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_static_discovery_rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, FakeProber::online(&[]), FakeNeighbors::empty());

        assert!(matches!(
            svc.start_static_discovery("10.0.0.9", "10.0.0.1", 1, 10),
            Err(DiscoveryError::InvalidRange(_))
        ));
        assert!(matches!(
            svc.start_static_discovery("10.0.0.1", "not-an-ip", 1, 10),
            Err(DiscoveryError::InvalidRange(_))
        ));
        assert!(matches!(
            svc.start_static_discovery("10.0.0.1", "10.0.0.9", 0, 10),
            Err(DiscoveryError::InvalidSettings(_))
        ));
        assert!(matches!(
            svc.start_static_discovery("10.0.0.1", "10.0.0.9", 1, 0),
            Err(DiscoveryError::InvalidSettings(_))
        ));
        assert!(svc.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_static_discovery_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let svc = service(
            &dir,
            FakeProber::online(&["10.0.0.2"]),
            FakeNeighbors::with(&[("10.0.0.2", "aa:bb:cc:dd:ee:02", NeighborState::Reachable)]),
        );

        let id = svc.start_static_discovery("10.0.0.1", "10.0.0.3", 1, 4).unwrap();
        let session = wait_for_terminal(svc.sessions(), &id).await;
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.mode, ScanMode::Static);
        assert_eq!(session.found_devices.len(), 1);
        assert_eq!(svc.cached_devices().len(), 1);

        assert_eq!(svc.progress(&id).unwrap().status, SessionStatus::Completed);
        assert!(svc.cancel(&id).is_ok());
    }

    #[tokio::test]
    async fn test_dhcp_discovery_uses_persisted_settings() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, FakeProber::online(&[]), FakeNeighbors::empty());

        let mut settings = svc.network_settings();
        settings.ip_range_start = "10.0.0.10".to_string();
        settings.ip_range_end = "10.0.0.19".to_string();
        svc.update_network_settings(settings).unwrap();

        let id = svc.start_dhcp_discovery().unwrap();
        let session = wait_for_terminal(svc.sessions(), &id).await;
        assert_eq!(session.mode, ScanMode::Dhcp);
        assert_eq!(session.total, 10);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, FakeProber::online(&[]), FakeNeighbors::empty());
        assert!(matches!(svc.progress("missing"), Err(DiscoveryError::SessionNotFound(_))));
        assert!(matches!(svc.cancel("missing"), Err(DiscoveryError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_ping_device_refreshes_cache() {
        let dir = TempDir::new().unwrap();
        let svc = service(
            &dir,
            FakeProber::online(&["10.0.0.5"]).with_hostname("10.0.0.5", "printer.lan"),
            FakeNeighbors::with(&[("10.0.0.5", "AA:BB:CC:DD:EE:05", NeighborState::Reachable)]),
        );

        let report = svc.ping_device("10.0.0.5").await.unwrap();
        assert!(report.online);
        assert_eq!(report.hostname, "printer.lan");
        assert_eq!(report.mac_address.as_deref(), Some("AA:BB:CC:DD:EE:05"));
        assert_eq!(report.packet_loss_pct, 0.0);
        let info = report.device_info.unwrap();
        assert_eq!(info.ip_address, ip("10.0.0.5"));
        assert_eq!(info.hostname, "printer.lan");
    }

    #[tokio::test]
    async fn test_ping_offline_device() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, FakeProber::online(&[]), FakeNeighbors::failing());

        let report = svc.ping_device("10.0.0.6").await.unwrap();
        assert!(!report.online);
        assert_eq!(report.hostname, "device-10-0-0-6");
        assert!(report.mac_address.is_none());
        assert!(report.device_info.is_none());
        assert!(svc.cached_devices().is_empty());

        assert!(matches!(
            svc.ping_device("10.0.0.255").await,
            Err(DiscoveryError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_save_device_name_on_cached_device() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, FakeProber::online(&[]), FakeNeighbors::empty());
        svc.cache()
            .update_device_info(
                ip("10.0.0.7"),
                DeviceRecord::new(ip("10.0.0.7"), "AA:BB:CC:DD:EE:07", DiscoveryMethod::NetworkScan),
            )
            .unwrap();

        let record = svc
            .save_device_name("10.0.0.7", Some("Reception".to_string()), Some("terminal".to_string()))
            .await
            .unwrap();
        assert_eq!(record.custom_name.as_deref(), Some("Reception"));
        assert_eq!(record.device_type, "terminal");

        let record = svc
            .save_device_name("aa-bb-cc-dd-ee-07", Some("Lobby".to_string()), None)
            .await
            .unwrap();
        assert_eq!(record.custom_name.as_deref(), Some("Lobby"));
        assert_eq!(record.device_type, "terminal");
    }

    #[tokio::test]
    async fn test_save_device_name_from_neighbor_table() {
        let dir = TempDir::new().unwrap();
        let svc = service(
            &dir,
            FakeProber::online(&[]),
            FakeNeighbors::with(&[("10.0.0.8", "AA:BB:CC:DD:EE:08", NeighborState::Stale)]),
        );

        let record = svc
            .save_device_name("AA:BB:CC:DD:EE:08", Some("Gate".to_string()), None)
            .await
            .unwrap();
        assert_eq!(record.ip_address, ip("10.0.0.8"));
        assert_eq!(record.custom_name.as_deref(), Some("Gate"));
        assert_eq!(svc.cached_devices().len(), 1);

        assert!(matches!(
            svc.save_device_name("10.0.0.99", Some("Nobody".to_string()), None).await,
            Err(DiscoveryError::DeviceNotFound(_))
        ));
        assert!(matches!(
            svc.save_device_name("garbage", None, None).await,
            Err(DiscoveryError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_arp_table_sorted() {
        let dir = TempDir::new().unwrap();
        let svc = service(
            &dir,
            FakeProber::online(&[]),
            FakeNeighbors::with(&[
                ("10.0.0.20", "AA:BB:CC:DD:EE:20", NeighborState::Stale),
                ("10.0.0.3", "AA:BB:CC:DD:EE:03", NeighborState::Reachable),
            ]),
        );

        let pairs = svc.refresh_arp_table().await.unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].ip, ip("10.0.0.3"));
        assert_eq!(pairs[1].mac, "AA:BB:CC:DD:EE:20");
    }

    #[tokio::test]
    async fn test_refresh_arp_table_surfaces_command_failure() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, FakeProber::online(&[]), FakeNeighbors::failing());
        assert!(matches!(svc.refresh_arp_table().await, Err(DiscoveryError::Command(_))));
    }

    #[tokio::test]
    async fn test_settings_and_cache_maintenance() {
        let dir = TempDir::new().unwrap();
        let svc = service(&dir, FakeProber::online(&[]), FakeNeighbors::empty());

        let mut settings = svc.network_settings();
        settings.scan_timeout = 30;
        assert!(matches!(
            svc.update_network_settings(settings),
            Err(DiscoveryError::InvalidSettings(_))
        ));

        svc.cache()
            .update_device_info(
                ip("10.0.0.4"),
                DeviceRecord::new(ip("10.0.0.4"), "AA:BB:CC:DD:EE:04", DiscoveryMethod::NetworkScan),
            )
            .unwrap();
        assert_eq!(svc.cleanup_cache().unwrap(), 0);
        let stats = svc.cache_stats();
        assert_eq!(stats.total_devices, 1);
        assert_eq!(stats.total_networks, 1);
    }
}
