//! Validity rules for addresses that may be stored or reported
//!
//! The neighbor-table reader and every cache mutator apply the same rules,
//! so a record rejected here can never reach the cache file.

use std::net::Ipv4Addr;

use crate::device::normalize_mac;

/// Prefix shared by all IPv4 multicast MAC addresses
const IPV4_MULTICAST_MAC_PREFIX: &str = "01:00:5E:";

/// Check that an IPv4 address can belong to a single host
pub fn is_valid_device_ip(ip: Ipv4Addr) -> bool {
    !(ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.octets()[3] == 255)
}

/// Parse a textual IP and apply [`is_valid_device_ip`]
pub fn parse_device_ip(raw: &str) -> Option<Ipv4Addr> {
    raw.trim()
        .parse::<Ipv4Addr>()
        .ok()
        .filter(|ip| is_valid_device_ip(*ip))
}

/// Check that a MAC identifies a single physical interface
pub fn is_valid_device_mac(mac: &str) -> bool {
    match normalize_mac(mac) {
        Some(mac) => {
            mac != "FF:FF:FF:FF:FF:FF"
                && mac != "00:00:00:00:00:00"
                && !mac.starts_with(IPV4_MULTICAST_MAC_PREFIX)
        }
        None => false,
    }
}

/// Normalize a MAC, returning it only if it passes [`is_valid_device_mac`]
pub fn valid_mac(mac: &str) -> Option<String> {
    normalize_mac(mac).filter(|m| is_valid_device_mac(m))
}
