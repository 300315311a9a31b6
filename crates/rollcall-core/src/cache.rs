//! MAC-keyed device cache, partitioned into `/24` network buckets
//!
//! The cache is a single JSON file:
//!
//! ```text
//! { "networks": { "<cidr>": { "name": ..., "devices": { "<ip>": DeviceRecord } } },
//!   "metadata": { "version", "last_updated", "total_devices", "total_networks" } }
//! ```
//!
//! Records are looked up by IP (through the bucket whose CIDR contains it) or
//! by MAC (linear scan). A MAC appears at most once across all buckets, which
//! is what lets a custom name follow a device through DHCP lease changes.
//! When a device's address is taken over by another MAC, its record moves to
//! `unassigned` (keyed by MAC) until the device shows up again.
//!
//! Every mutation works on a copy under one mutex; the copy replaces the
//! in-memory state only after it is saved. A save is a single transaction:
//! write `<file>.tmp`, fsync, copy the current file to `<file>.backup`,
//! rename the temp file over the original.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{normalize_mac, placeholder_hostname, DeviceRecord};
use crate::filter::{is_valid_device_ip, is_valid_device_mac, valid_mac};
use crate::net::{IpRange, Ipv4Cidr};
use crate::vendor;

/// Version written into the cache metadata
pub const CACHE_VERSION: &str = "2.0";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Devices belonging to one network prefix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkBucket {
    pub name: String,
    /// Records keyed by their dotted-quad IP
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceRecord>,
}

impl NetworkBucket {
    fn for_cidr(cidr: &Ipv4Cidr) -> Self {
        Self {
            name: format!("Network {}", cidr),
            devices: BTreeMap::new(),
        }
    }
}

/// Summary recomputed on every save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub total_devices: usize,
    pub total_networks: usize,
}

impl Default for CacheMetadata {
    fn default() -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            last_updated: None,
            total_devices: 0,
            total_networks: 0,
        }
    }
}

/// The whole persisted store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheFile {
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkBucket>,
    /// Records whose last address now belongs to another MAC, keyed by MAC
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unassigned: BTreeMap<String, DeviceRecord>,
    #[serde(default)]
    pub metadata: CacheMetadata,
}

impl CacheFile {
    /// Key of the bucket whose CIDR contains `ip`, longest prefix first
    fn bucket_key_for(&self, ip: Ipv4Addr) -> Option<String> {
        self.networks
            .keys()
            .filter_map(|key| key.parse::<Ipv4Cidr>().ok().map(|cidr| (key, cidr)))
            .filter(|(_, cidr)| cidr.contains(ip))
            .max_by_key(|(_, cidr)| cidr.prefix_len())
            .map(|(key, _)| key.clone())
    }

    fn get(&self, ip: Ipv4Addr) -> Option<&DeviceRecord> {
        let key = self.bucket_key_for(ip)?;
        self.networks.get(&key)?.devices.get(&ip.to_string())
    }

    fn find_mac(&self, mac: &str) -> Option<&DeviceRecord> {
        self.records()
            .filter(|record| record.mac_address == mac)
            .max_by_key(|record| record.last_seen)
            .or_else(|| self.unassigned.get(mac))
    }

    /// True when the record for `mac` currently holds `ip`
    fn holds(&self, mac: &str, ip: Ipv4Addr) -> bool {
        self.get(ip).is_some_and(|record| record.mac_address == mac)
    }

    fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.networks.values().flat_map(|bucket| bucket.devices.values())
    }

    /// Insert under the owning bucket, creating a `/24` bucket when none contains the IP.
    /// Returns the record it displaced at the same IP, if any.
    fn insert(&mut self, record: DeviceRecord) -> Option<DeviceRecord> {
        let ip = record.ip_address;
        let key = match self.bucket_key_for(ip) {
            Some(key) => key,
            None => {
                let cidr = Ipv4Cidr::bucket_for(ip);
                debug!(network = %cidr, "Creating network bucket");
                self.networks
                    .insert(cidr.to_string(), NetworkBucket::for_cidr(&cidr));
                cidr.to_string()
            }
        };
        self.networks
            .entry(key)
            .or_default()
            .devices
            .insert(ip.to_string(), record)
    }

    /// Insert like [`CacheFile::insert`], parking a displaced record that
    /// belongs to another MAC under `unassigned`
    fn place(&mut self, record: DeviceRecord) {
        let mac = record.mac_address.clone();
        let Some(displaced) = self.insert(record) else {
            return;
        };
        if displaced.mac_address != mac && is_valid_device_mac(&displaced.mac_address) {
            debug!(
                ip = %displaced.ip_address,
                old_mac = %displaced.mac_address,
                new_mac = %mac,
                "Address taken over, keeping previous device as unassigned"
            );
            self.unassigned.insert(displaced.mac_address.clone(), displaced);
        }
    }

    /// Remove every record carrying `mac`, returning the most recently seen one
    fn take_mac(&mut self, mac: &str) -> Option<DeviceRecord> {
        let mut taken: Vec<DeviceRecord> = self.unassigned.remove(mac).into_iter().collect();
        for bucket in self.networks.values_mut() {
            let keys: Vec<String> = bucket
                .devices
                .iter()
                .filter(|(_, record)| record.mac_address == mac)
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(record) = bucket.devices.remove(&key) {
                    taken.push(record);
                }
            }
        }
        taken.into_iter().max_by_key(|record| record.last_seen)
    }

    fn prune_empty_buckets(&mut self) {
        self.networks.retain(|_, bucket| !bucket.devices.is_empty());
    }

    fn refresh_metadata(&mut self) {
        self.metadata = CacheMetadata {
            version: CACHE_VERSION.to_string(),
            last_updated: Some(Utc::now()),
            total_devices: self.records().count() + self.unassigned.len(),
            total_networks: self.networks.len(),
        };
    }
}

/// How a caller identifies a cached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKey {
    Ip(Ipv4Addr),
    Mac(String),
}

impl DeviceKey {
    /// Interpret `raw` as an IPv4 address or, failing that, a MAC
    pub fn parse(raw: &str) -> Option<Self> {
        if let Ok(ip) = raw.trim().parse::<Ipv4Addr>() {
            return Some(Self::Ip(ip));
        }
        normalize_mac(raw).map(Self::Mac)
    }
}

/// Thread-safe, file-backed device cache
#[derive(Debug)]
pub struct DeviceCache {
    path: PathBuf,
    state: Mutex<CacheFile>,
}

impl DeviceCache {
    /// Open the cache at `path`.
    ///
    /// A missing file starts an empty cache. An unreadable, empty or
    /// malformed file is replaced by a fresh empty cache (the damaged file
    /// ends up as the `.backup`).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (file, regenerate) = load_cache_file(&path);
        let cache = Self {
            path,
            state: Mutex::new(file),
        };

        if regenerate {
            let mut file = cache.lock();
            if let Err(e) = cache.commit(&mut file, CacheFile::default()) {
                warn!(path = %cache.path.display(), error = %e, "Failed to regenerate device cache");
            }
        }
        cache
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the copy kept from before the last save
    pub fn backup_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, "backup")
    }

    fn lock(&self) -> MutexGuard<'_, CacheFile> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Save `next` and make it the in-memory state. On error the current
    /// state is left untouched. Callers hold the lock.
    fn commit(&self, current: &mut CacheFile, mut next: CacheFile) -> Result<(), CacheError> {
        self.persist(&mut next)?;
        *current = next;
        Ok(())
    }

    /// Write the cache file as one transaction
    fn persist(&self, file: &mut CacheFile) -> Result<(), CacheError> {
        file.refresh_metadata();
        let content = serde_json::to_string_pretty(file)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = sibling_with_suffix(&self.path, "tmp");
        {
            let mut tmp = fs::File::create(&tmp_path)?;
            tmp.write_all(content.as_bytes())?;
            tmp.sync_all()?;
        }

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            devices = file.metadata.total_devices,
            networks = file.metadata.total_networks,
            "Saved device cache"
        );
        Ok(())
    }

    /// Look up the record currently holding `ip`
    pub fn get_device_info(&self, ip: Ipv4Addr) -> Option<DeviceRecord> {
        self.lock().get(ip).cloned()
    }

    /// Look up a record by MAC in any format [`normalize_mac`] accepts
    pub fn get_device_by_mac(&self, mac: &str) -> Option<DeviceRecord> {
        let mac = normalize_mac(mac)?;
        self.lock().find_mac(&mac).cloned()
    }

    /// Look up by IP or MAC
    pub fn get(&self, key: &DeviceKey) -> Option<DeviceRecord> {
        match key {
            DeviceKey::Ip(ip) => self.get_device_info(*ip),
            DeviceKey::Mac(mac) => self.get_device_by_mac(mac),
        }
    }

    /// Upsert `record` at `ip` and save.
    ///
    /// Records with an invalid IP or MAC (including the "Unknown"
    /// placeholder) are dropped and `Ok(false)` is returned. Any other
    /// record for the same MAC is replaced, and operator metadata it carried
    /// is inherited by the new record.
    pub fn update_device_info(
        &self,
        ip: Ipv4Addr,
        mut record: DeviceRecord,
    ) -> Result<bool, CacheError> {
        if !is_valid_device_ip(ip) {
            debug!(ip = %ip, "Dropping device with invalid IP");
            return Ok(false);
        }
        let Some(mac) = valid_mac(&record.mac_address) else {
            debug!(ip = %ip, mac = %record.mac_address, "Dropping device with invalid MAC");
            return Ok(false);
        };

        if record.hostname.trim().is_empty() || record.hostname == placeholder_hostname(record.ip_address) {
            record.hostname = placeholder_hostname(ip);
        }
        record.ip_address = ip;
        record.mac_address = mac.clone();
        record.touch();

        let mut file = self.lock();
        let mut next = file.clone();
        if let Some(previous) = next.take_mac(&mac) {
            if previous.ip_address != ip {
                debug!(mac = %mac, old_ip = %previous.ip_address, new_ip = %ip, "Device moved");
            }
            record.inherit_metadata(&previous);
        }
        vendor::classify(&mut record);

        next.place(record);
        next.prune_empty_buckets();
        self.commit(&mut file, next)?;
        Ok(true)
    }

    /// Move the record for `mac` to `new_ip`, keeping all its metadata.
    ///
    /// Returns `Ok(true)` only if a record was moved; an unknown MAC, an
    /// invalid address, or an unchanged IP is a no-op. A different device
    /// holding `new_ip` is kept as unassigned.
    pub fn update_device_ip_by_mac(&self, mac: &str, new_ip: Ipv4Addr) -> Result<bool, CacheError> {
        Ok(self.reassign_ips(&[(mac.to_string(), new_ip)])? > 0)
    }

    /// Apply several MAC -> IP moves as one save.
    ///
    /// Every moving record is lifted out before any is placed, so devices
    /// that swapped addresses end up at their new IPs. Entries with an
    /// unknown MAC, an invalid address, or no change are skipped. Returns the
    /// number of records moved.
    pub fn reassign_ips(&self, moves: &[(String, Ipv4Addr)]) -> Result<usize, CacheError> {
        let mut file = self.lock();
        let mut next = file.clone();

        let mut lifted: Vec<(DeviceRecord, Ipv4Addr)> = Vec::new();
        for (mac, new_ip) in moves {
            let Some(mac) = valid_mac(mac) else {
                continue;
            };
            if !is_valid_device_ip(*new_ip)
                || next.holds(&mac, *new_ip)
                || lifted.iter().any(|(record, _)| record.mac_address == mac)
            {
                continue;
            }
            if let Some(record) = next.take_mac(&mac) {
                lifted.push((record, *new_ip));
            }
        }
        if lifted.is_empty() {
            return Ok(0);
        }

        let moved = lifted.len();
        let mut reassigned = Vec::with_capacity(moved);
        for (mut record, new_ip) in lifted {
            let old_ip = record.ip_address;
            if record.hostname == placeholder_hostname(old_ip) {
                record.hostname = placeholder_hostname(new_ip);
            }
            record.ip_address = new_ip;
            record.touch();
            reassigned.push((record.mac_address.clone(), old_ip, new_ip));
            next.place(record);
        }
        next.prune_empty_buckets();
        self.commit(&mut file, next)?;

        for (mac, old_ip, new_ip) in reassigned {
            info!(mac = %mac, old_ip = %old_ip, new_ip = %new_ip, "Device IP reassigned");
        }
        Ok(moved)
    }

    /// Remove records with an invalid IP or MAC and collapse duplicate MACs.
    ///
    /// Empty buckets are dropped and misplaced records re-homed. Saves only
    /// when something changed; returns the number of records removed.
    pub fn cleanup_invalid_devices(&self) -> Result<usize, CacheError> {
        let mut file = self.lock();

        let mut removed = 0usize;
        let mut by_mac: HashMap<String, DeviceRecord> = HashMap::new();
        for (bucket_key, bucket) in &file.networks {
            for (ip_key, record) in &bucket.devices {
                let key_ip = ip_key.parse::<Ipv4Addr>().ok();
                let valid = key_ip == Some(record.ip_address)
                    && is_valid_device_ip(record.ip_address)
                    && is_valid_device_mac(&record.mac_address);
                if !valid {
                    debug!(network = %bucket_key, ip = %ip_key, mac = %record.mac_address, "Removing invalid device");
                    removed += 1;
                    continue;
                }

                let mut record = record.clone();
                if let Some(mac) = normalize_mac(&record.mac_address) {
                    record.mac_address = mac;
                }
                match by_mac.get(&record.mac_address) {
                    Some(kept) if kept.last_seen >= record.last_seen => {
                        debug!(mac = %record.mac_address, ip = %record.ip_address, "Removing duplicate MAC");
                        removed += 1;
                    }
                    Some(_) => {
                        removed += 1;
                        by_mac.insert(record.mac_address.clone(), record);
                    }
                    None => {
                        by_mac.insert(record.mac_address.clone(), record);
                    }
                }
            }
        }

        let mut unassigned = BTreeMap::new();
        for (key, record) in &file.unassigned {
            match valid_mac(&record.mac_address) {
                Some(mac) if &mac == key && !by_mac.contains_key(&mac) => {
                    unassigned.insert(mac, record.clone());
                }
                _ => {
                    debug!(mac = %key, "Removing invalid or duplicate unassigned device");
                    removed += 1;
                }
            }
        }

        let mut rebuilt = CacheFile {
            unassigned,
            networks: file
                .networks
                .iter()
                .filter(|(key, _)| key.parse::<Ipv4Cidr>().is_ok())
                .map(|(key, bucket)| {
                    let empty = NetworkBucket {
                        name: bucket.name.clone(),
                        devices: BTreeMap::new(),
                    };
                    (key.clone(), empty)
                })
                .collect(),
            metadata: file.metadata.clone(),
        };
        for record in by_mac.into_values() {
            rebuilt.place(record);
        }
        rebuilt.prune_empty_buckets();

        if rebuilt.networks != file.networks || rebuilt.unassigned != file.unassigned {
            self.commit(&mut file, rebuilt)?;
        }

        if removed > 0 {
            info!(removed, "Cleaned up invalid cached devices");
        }
        Ok(removed)
    }

    /// Set (or clear, with `None`) the operator label and type of a cached device
    pub fn set_custom_name(
        &self,
        key: &DeviceKey,
        custom_name: Option<String>,
        device_type: Option<String>,
    ) -> Result<Option<DeviceRecord>, CacheError> {
        let mut file = self.lock();
        let mut next = file.clone();
        let current = match key {
            DeviceKey::Ip(ip) => next.get(*ip).cloned(),
            DeviceKey::Mac(mac) => normalize_mac(mac).and_then(|mac| next.find_mac(&mac).cloned()),
        };
        let Some(mut record) = current else {
            return Ok(None);
        };

        record.custom_name = custom_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        if let Some(device_type) = device_type.filter(|t| !t.trim().is_empty()) {
            record.device_type = device_type.trim().to_string();
        }
        record.touch();

        if next.unassigned.contains_key(&record.mac_address) {
            next.unassigned.insert(record.mac_address.clone(), record.clone());
        } else {
            next.take_mac(&record.mac_address);
            next.place(record.clone());
        }
        self.commit(&mut file, next)?;
        Ok(Some(record))
    }

    /// Every record that currently holds an address, ordered by IP.
    /// Unassigned devices are only reachable by MAC.
    pub fn all_devices(&self) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self.lock().records().cloned().collect();
        devices.sort_by_key(|record| record.ip_address);
        devices
    }

    /// Cached records whose current IP falls inside `range`, ordered by IP
    pub fn devices_in_range(&self, range: &IpRange) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self
            .lock()
            .records()
            .filter(|record| range.contains(record.ip_address))
            .cloned()
            .collect();
        devices.sort_by_key(|record| record.ip_address);
        devices
    }

    /// Current totals (not persisted)
    pub fn stats(&self) -> CacheMetadata {
        let file = self.lock();
        CacheMetadata {
            version: file.metadata.version.clone(),
            last_updated: file.metadata.last_updated,
            total_devices: file.records().count() + file.unassigned.len(),
            total_networks: file.networks.len(),
        }
    }

    /// Drop every record and save; returns how many were removed
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut file = self.lock();
        let count = file.records().count() + file.unassigned.len();
        self.commit(&mut file, CacheFile::default())?;
        info!(count, "Cleared device cache");
        Ok(count)
    }
}

/// `<name>.<suffix>` next to `path`
fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Load the cache file; the flag is set when the file must be regenerated
fn load_cache_file(path: &Path) -> (CacheFile, bool) {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Device cache not found, starting empty");
            return (CacheFile::default(), false);
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read device cache, regenerating");
            return (CacheFile::default(), true);
        }
    };

    if content.trim().is_empty() {
        warn!(path = %path.display(), "Device cache is empty, regenerating");
        return (CacheFile::default(), true);
    }

    match serde_json::from_str::<CacheFile>(&content) {
        Ok(file) => {
            info!(
                path = %path.display(),
                devices = file.records().count(),
                networks = file.networks.len(),
                "Loaded device cache"
            );
            (file, false)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Device cache is corrupt, regenerating");
            (CacheFile::default(), true)
        }
    }
}
