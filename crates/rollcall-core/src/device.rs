//! Device records for hosts observed on the local network

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// MAC placeholder for hosts that answered but could not be identified
pub const UNKNOWN_MAC: &str = "Unknown";

/// Default value for best-effort classification fields
pub const UNKNOWN: &str = "unknown";

/// How a device made it into a result set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    /// Emitted from the device cache without touching the network
    Cache,
    /// Answered an echo probe during a sweep
    NetworkScan,
    /// Only seen as an active entry in the neighbor table
    Arp,
}

/// One physical device, keyed durably by its MAC address.
///
/// `ip_address` is a point-in-time attribute that changes under DHCP;
/// `custom_name` belongs to the MAC and survives those changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceRecord {
    /// Current IPv4 address
    pub ip_address: Ipv4Addr,
    /// Normalized upper-case colon MAC, or [`UNKNOWN_MAC`]
    pub mac_address: String,
    /// Reverse-resolved name or a synthesized placeholder
    pub hostname: String,
    /// Operator-assigned label
    #[serde(default)]
    pub custom_name: Option<String>,
    #[serde(default = "default_unknown")]
    pub device_type: String,
    #[serde(default = "default_unknown")]
    pub manufacturer: String,
    /// Most recent successful probe or cache touch
    pub last_seen: DateTime<Utc>,
    pub discovery_method: DiscoveryMethod,
}

fn default_unknown() -> String {
    UNKNOWN.to_string()
}

impl DeviceRecord {
    /// Create a record with default classification and a fresh timestamp
    pub fn new(ip: Ipv4Addr, mac: impl Into<String>, method: DiscoveryMethod) -> Self {
        Self {
            ip_address: ip,
            mac_address: mac.into(),
            hostname: placeholder_hostname(ip),
            custom_name: None,
            device_type: default_unknown(),
            manufacturer: default_unknown(),
            last_seen: Utc::now(),
            discovery_method: method,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// True when the MAC is the "Unknown" placeholder
    pub fn is_unidentified(&self) -> bool {
        self.mac_address == UNKNOWN_MAC
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    /// Copy operator metadata from an older record of the same device.
    ///
    /// Only fields still at their defaults are filled in.
    pub fn inherit_metadata(&mut self, previous: &DeviceRecord) {
        if self.custom_name.is_none() {
            self.custom_name = previous.custom_name.clone();
        }
        if self.device_type == UNKNOWN && previous.device_type != UNKNOWN {
            self.device_type = previous.device_type.clone();
        }
        if self.manufacturer == UNKNOWN && previous.manufacturer != UNKNOWN {
            self.manufacturer = previous.manufacturer.clone();
        }
        if self.hostname == placeholder_hostname(self.ip_address)
            && previous.hostname != placeholder_hostname(previous.ip_address)
        {
            self.hostname = previous.hostname.clone();
        }
    }
}

/// Hostname used when reverse resolution yields nothing
pub fn placeholder_hostname(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("device-{}-{}-{}-{}", a, b, c, d)
}

/// Normalize a MAC address to upper-case colon form.
///
/// Accepts `:` or `-` separators and single-digit octets as printed by BSD
/// `arp` (`a:b:c:d:e:f`). Returns `None` for anything that is not six octets.
pub fn normalize_mac(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut octets = Vec::with_capacity(6);
    for part in parts {
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        let value = u8::from_str_radix(part, 16).ok()?;
        octets.push(format!("{:02X}", value));
    }
    Some(octets.join(":"))
}
