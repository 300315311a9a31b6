//! Scan orchestrator: drives one discovery session from start to finish
//!
//! A session reads the neighbor table once, optionally emits cached devices
//! in range (DHCP mode), then probes the remaining addresses in fixed-size
//! batches on a bounded worker pool. Each online host is resolved to a MAC,
//! deduplicated, written to the cache and appended to the session.

use anyhow::anyhow;
use rollcall_core::device::{placeholder_hostname, DeviceRecord, DiscoveryMethod, UNKNOWN_MAC};
use rollcall_core::filter::{is_valid_device_ip, valid_mac};
use rollcall_core::settings::MAX_CONCURRENT_SCANS;
use rollcall_core::{DeviceCache, IpRange, NetworkSettings};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::arp::{NeighborEntry, NeighborSource, NeighborTable};
use crate::error::{DiscoveryError, Result};
use crate::probe::{ProbeResult, Prober};
use crate::session::{ScanMode, SessionRegistry, SessionStatus};

/// Addresses probed between two progress snapshots and cancellation checks
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Orchestrator tuning shared by all sessions
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub batch_size: usize,
    /// Echo requests per host during a sweep
    pub sweep_ping_count: u32,
    /// Keep online hosts without a resolvable MAC in DHCP mode.
    /// Static mode always keeps them.
    pub include_unidentified: bool,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            sweep_ping_count: 1,
            include_unidentified: true,
        }
    }
}

/// Parameters of one discovery session
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub mode: ScanMode,
    pub range: IpRange,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Worker pool size
    pub concurrency: usize,
}

impl ScanRequest {
    /// Build a request from persisted settings, validating them
    pub fn from_settings(mode: ScanMode, settings: &NetworkSettings) -> Result<Self> {
        let range = settings.validate()?;
        Ok(Self {
            mode,
            range,
            timeout: settings.timeout(),
            concurrency: settings.concurrent_scans,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(DiscoveryError::InvalidSettings(
                "scan timeout must be positive".to_string(),
            ));
        }
        if !(1..=MAX_CONCURRENT_SCANS).contains(&self.concurrency) {
            return Err(DiscoveryError::InvalidSettings(format!(
                "concurrent_scans must be between 1 and {}",
                MAX_CONCURRENT_SCANS
            )));
        }
        Ok(())
    }
}

/// How a session's scan loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    Completed,
    Cancelled,
}

/// One worker's report for one address
#[derive(Debug)]
struct HostObservation {
    ip: Ipv4Addr,
    probe: ProbeResult,
    hostname: Option<String>,
}

/// Devices found in one session: one entry per IP, one per known MAC
#[derive(Debug, Default)]
struct ResultSet {
    devices: Vec<DeviceRecord>,
    macs: HashSet<String>,
    ips: HashMap<Ipv4Addr, usize>,
}

impl ResultSet {
    fn has_mac(&self, mac: &str) -> bool {
        self.macs.contains(mac)
    }

    fn has_ip(&self, ip: Ipv4Addr) -> bool {
        self.ips.contains_key(&ip)
    }

    /// Add a device; a later record for the same IP replaces the earlier one.
    /// Returns `false` if its MAC is already present.
    fn insert(&mut self, record: DeviceRecord) -> bool {
        if !record.is_unidentified() && self.macs.contains(&record.mac_address) {
            return false;
        }
        if !record.is_unidentified() {
            self.macs.insert(record.mac_address.clone());
        }

        match self.ips.get(&record.ip_address) {
            Some(&idx) => {
                let replaced = std::mem::replace(&mut self.devices[idx], record);
                if replaced.mac_address != self.devices[idx].mac_address {
                    self.macs.remove(&replaced.mac_address);
                }
            }
            None => {
                self.ips.insert(record.ip_address, self.devices.len());
                self.devices.push(record);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.devices.len()
    }
}

/// Runs discovery sessions against the shared cache and session registry
pub struct ScanOrchestrator {
    cache: Arc<DeviceCache>,
    sessions: Arc<SessionRegistry>,
    prober: Arc<dyn Prober>,
    neighbors: Arc<dyn NeighborSource>,
    config: ScannerConfig,
}

impl ScanOrchestrator {
    pub fn new(
        cache: Arc<DeviceCache>,
        sessions: Arc<SessionRegistry>,
        prober: Arc<dyn Prober>,
        neighbors: Arc<dyn NeighborSource>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            cache,
            sessions,
            prober,
            neighbors,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn cache(&self) -> &Arc<DeviceCache> {
        &self.cache
    }

    /// Create a session and run it in the background; returns immediately.
    pub fn start(self: &Arc<Self>, request: ScanRequest) -> String {
        let id = self.sessions.create_session(request.mode);
        let this = Arc::clone(self);
        let session_id = id.clone();

        tokio::spawn(async move {
            // A panic inside the scan must still leave the session inspectable
            let worker = {
                let this = Arc::clone(&this);
                let session_id = session_id.clone();
                tokio::spawn(async move { this.scan(&session_id, &request).await })
            };
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(e) => Err(anyhow!("Discovery task aborted: {}", e)),
            };
            this.finish(&session_id, outcome);
        });

        id
    }

    async fn scan(&self, id: &str, request: &ScanRequest) -> anyhow::Result<ScanOutcome> {
        request.validate()?;
        let batch_size = self.config.batch_size.max(1);

        self.sessions.update(id, |s| {
            s.status = SessionStatus::Scanning;
            s.message = format!("Reading neighbor table for {}", request.range);
        });
        info!(
            session = %id,
            mode = ?request.mode,
            range = %request.range,
            concurrency = request.concurrency,
            "Starting discovery"
        );

        let neighbors = match self.neighbors.read_neighbor_table().await {
            Ok(table) => table,
            Err(e) => {
                warn!(session = %id, error = %e, "Neighbor table unavailable, continuing without it");
                NeighborTable::new()
            }
        };

        let mut results = ResultSet::default();

        if request.mode == ScanMode::Dhcp {
            if self.sessions.is_cancelled(id) {
                return Ok(ScanOutcome::Cancelled);
            }
            self.emit_cached(request, &neighbors, &mut results);
            let found = results.devices.clone();
            self.sessions.update(id, |s| {
                s.found_devices = found;
                s.message = format!("{} cached devices in range", s.found_devices.len());
            });
            debug!(session = %id, cached = results.len(), "Emitted cached devices");
        }

        let targets: Vec<Ipv4Addr> = request
            .range
            .addresses()
            .filter(|ip| is_valid_device_ip(*ip) && !results.has_ip(*ip))
            .collect();
        let total = targets.len();
        self.sessions.update(id, |s| {
            s.total = total;
            s.message = format!("Probing {} addresses", total);
        });

        let semaphore = Arc::new(Semaphore::new(request.concurrency));
        let mut current = 0usize;

        for batch in targets.chunks(batch_size) {
            if self.sessions.is_cancelled(id) {
                return Ok(ScanOutcome::Cancelled);
            }

            let observations = self.probe_batch(batch, request, &neighbors, &semaphore).await;
            for observation in observations {
                if let Some(record) = self.admit(observation, &neighbors, request.mode, &results) {
                    debug!(session = %id, ip = %record.ip_address, mac = %record.mac_address, "Device found");
                    results.insert(record);
                }
            }

            current += batch.len();
            let progress = (current * 100 / total.max(1)).min(100) as u8;
            let found = results.devices.clone();
            self.sessions.update(id, |s| {
                s.current = current;
                s.progress = progress;
                s.message = format!(
                    "Scanned {} of {} addresses, {} devices found",
                    current,
                    total,
                    found.len()
                );
                s.found_devices = found;
            });
        }

        if self.sessions.is_cancelled(id) {
            return Ok(ScanOutcome::Cancelled);
        }
        Ok(ScanOutcome::Completed)
    }

    /// DHCP fast path: emit cached devices in range, following MACs the
    /// neighbor table now reports under a different IP.
    ///
    /// All moves are applied as one batch before anything is emitted. A
    /// cached device whose address the neighbor table assigns to another MAC
    /// is left out so the address gets scanned.
    fn emit_cached(&self, request: &ScanRequest, neighbors: &NeighborTable, results: &mut ResultSet) {
        let mut by_mac: HashMap<&str, Vec<&NeighborEntry>> = HashMap::new();
        for entry in neighbors.values() {
            by_mac.entry(entry.mac.as_str()).or_default().push(entry);
        }

        let snapshots = self.cache.devices_in_range(&request.range);
        let moves: Vec<(String, Ipv4Addr)> = snapshots
            .iter()
            .filter_map(|device| {
                let candidates = by_mac.get(device.mac_address.as_str())?;
                let current_ip = neighbor_ip_for(candidates, device.ip_address)?;
                (current_ip != device.ip_address).then(|| (device.mac_address.clone(), current_ip))
            })
            .collect();
        if !moves.is_empty() {
            if let Err(e) = self.cache.reassign_ips(&moves) {
                warn!(moves = moves.len(), error = %e, "Failed to record IP changes");
            }
        }

        for snapshot in snapshots {
            let Some(mut device) = self.cache.get_device_by_mac(&snapshot.mac_address) else {
                continue;
            };
            if results.has_mac(&device.mac_address) {
                continue;
            }
            // Parked by a move above
            let holds_ip = self
                .cache
                .get_device_info(device.ip_address)
                .is_some_and(|held| held.mac_address == device.mac_address);
            if !holds_ip {
                continue;
            }
            if let Some(entry) = neighbors.get(&device.ip_address) {
                if entry.mac != device.mac_address {
                    debug!(
                        ip = %device.ip_address,
                        cached_mac = %device.mac_address,
                        neighbor_mac = %entry.mac,
                        "Cached address now answers with another MAC"
                    );
                    continue;
                }
            }

            device.discovery_method = DiscoveryMethod::Cache;
            results.insert(device);
        }
    }

    /// Probe one batch with at most `request.concurrency` probes in flight
    async fn probe_batch(
        &self,
        batch: &[Ipv4Addr],
        request: &ScanRequest,
        neighbors: &NeighborTable,
        semaphore: &Arc<Semaphore>,
    ) -> Vec<HostObservation> {
        let mut tasks = JoinSet::new();

        for &ip in batch {
            let prober = Arc::clone(&self.prober);
            let semaphore = Arc::clone(semaphore);
            let timeout = request.timeout;
            let count = self.config.sweep_ping_count;
            let neighbor_active = neighbors
                .get(&ip)
                .map(|entry| entry.state.is_active())
                .unwrap_or(false);

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let probe = prober.probe(ip, timeout, count).await;
                let hostname = if probe.online || neighbor_active {
                    prober.resolve_hostname(ip).await
                } else {
                    None
                };
                Some(HostObservation { ip, probe, hostname })
            });
        }

        let mut observations = Vec::with_capacity(batch.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(observation)) => observations.push(observation),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Probe task failed"),
            }
        }
        observations
    }

    /// Turn an observation into a result record, updating the cache.
    ///
    /// MAC precedence: neighbor table, then the cache's last known MAC for
    /// the IP, then "Unknown".
    fn admit(
        &self,
        observation: HostObservation,
        neighbors: &NeighborTable,
        mode: ScanMode,
        results: &ResultSet,
    ) -> Option<DeviceRecord> {
        let ip = observation.ip;
        let neighbor = neighbors.get(&ip);

        let method = if observation.probe.online {
            DiscoveryMethod::NetworkScan
        } else if neighbor.map(|n| n.state.is_active()).unwrap_or(false) {
            DiscoveryMethod::Arp
        } else {
            return None;
        };

        let mac = neighbor
            .map(|n| n.mac.clone())
            .or_else(|| {
                self.cache
                    .get_device_info(ip)
                    .and_then(|cached| valid_mac(&cached.mac_address))
            });

        let Some(mac) = mac else {
            if mode == ScanMode::Dhcp && !self.config.include_unidentified {
                debug!(ip = %ip, "Skipping online host without MAC");
                return None;
            }
            let hostname = observation
                .hostname
                .unwrap_or_else(|| placeholder_hostname(ip));
            return Some(DeviceRecord::new(ip, UNKNOWN_MAC, method).with_hostname(hostname));
        };

        if results.has_mac(&mac) {
            debug!(ip = %ip, mac = %mac, "Duplicate MAC in session, skipping");
            return None;
        }

        let mut record = DeviceRecord::new(ip, mac.clone(), method);
        if let Some(hostname) = observation.hostname {
            record.hostname = hostname;
        }

        if let Some(previous) = self.cache.get_device_by_mac(&mac) {
            if previous.ip_address != ip {
                if let Err(e) = self.cache.update_device_ip_by_mac(&mac, ip) {
                    warn!(mac = %mac, error = %e, "Failed to record IP change");
                }
            }
        }
        if let Err(e) = self.cache.update_device_info(ip, record.clone()) {
            warn!(ip = %ip, error = %e, "Failed to cache device");
        }
        if let Some(stored) = self.cache.get_device_by_mac(&mac) {
            record = stored;
        }

        Some(record)
    }

    /// Write the terminal state for a session. A cancel that lands after
    /// the last check still ends the session as cancelled.
    fn finish(&self, id: &str, outcome: anyhow::Result<ScanOutcome>) {
        match outcome {
            Ok(outcome) => {
                self.sessions.update(id, |s| {
                    if outcome == ScanOutcome::Cancelled || s.cancelled {
                        info!(session = %s.id, "Discovery cancelled");
                        s.status = SessionStatus::Cancelled;
                        s.message = format!(
                            "Discovery cancelled: {} devices found before cancellation",
                            s.found_devices.len()
                        );
                    } else {
                        s.status = SessionStatus::Completed;
                        s.progress = 100;
                        s.current = s.total;
                        s.message = format!(
                            "Discovery complete: {} devices found",
                            s.found_devices.len()
                        );
                    }
                });
            }
            Err(e) => {
                error!(session = %id, error = %e, "Discovery failed");
                let message = e.to_string();
                self.sessions.update(id, |s| {
                    s.status = SessionStatus::Error;
                    s.message = format!("Discovery failed: {}", message);
                    s.error = Some(message);
                });
            }
        }
    }
}

/// Where the neighbor table places a MAC it may list more than once:
/// active entries first, then the cached address, then the lowest IP.
fn neighbor_ip_for(candidates: &[&NeighborEntry], cached_ip: Ipv4Addr) -> Option<Ipv4Addr> {
    candidates
        .iter()
        .min_by_key(|entry| (!entry.state.is_active(), entry.ip != cached_ip, entry.ip))
        .map(|entry| entry.ip)
}
