//! Rollcall Core - Device records and the durable device cache
//!
//! This crate provides the foundational types for LAN device discovery:
//! - Device records keyed by MAC address, with IP as a mutable attribute
//! - Validity filters shared by the neighbor-table reader and the cache
//! - IPv4 CIDR buckets and inclusive scan ranges
//! - The network-partitioned, file-backed device cache
//! - Persisted network settings for DHCP-range sweeps

pub mod cache;
pub mod device;
pub mod filter;
pub mod net;
pub mod settings;
pub mod vendor;

pub use cache::{CacheError, CacheFile, CacheMetadata, DeviceCache, DeviceKey, NetworkBucket};
pub use device::{normalize_mac, DeviceRecord, DiscoveryMethod, UNKNOWN_MAC};
pub use filter::{is_valid_device_ip, is_valid_device_mac};
pub use net::{IpRange, Ipv4Cidr, RangeError};
pub use settings::{NetworkSettings, SettingsError, SettingsStore};
