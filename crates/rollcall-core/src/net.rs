//! IPv4 network helpers: CIDR buckets and inclusive scan ranges

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

/// Largest range a single discovery session may cover
pub const MAX_RANGE_ADDRESSES: u64 = 65_536;

/// Prefix length of the buckets the device cache partitions into
pub const BUCKET_PREFIX_LEN: u8 = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("Invalid IPv4 address: {0}")]
    InvalidAddress(String),
    #[error("Range start {start} is after range end {end}")]
    Reversed { start: Ipv4Addr, end: Ipv4Addr },
    #[error("Range of {0} addresses exceeds the limit of {MAX_RANGE_ADDRESSES}")]
    TooLarge(u64),
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),
}

fn prefix_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        0xFFFF_FFFF
    } else {
        !((1u32 << (32 - prefix_len)) - 1)
    }
}

/// An IPv4 network in `a.b.c.d/n` form, stored with host bits cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        let prefix_len = prefix_len.min(32);
        let network = Ipv4Addr::from(u32::from(addr) & prefix_mask(prefix_len));
        Self { network, prefix_len }
    }

    /// The cache bucket (`/24`) that owns `ip`
    pub fn bucket_for(ip: Ipv4Addr) -> Self {
        Self::new(ip, BUCKET_PREFIX_LEN)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = prefix_mask(self.prefix_len);
        (u32::from(ip) & mask) == u32::from(self.network)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| RangeError::InvalidCidr(s.to_string()))?;
        let addr = Ipv4Addr::from_str(addr).map_err(|_| RangeError::InvalidCidr(s.to_string()))?;
        let prefix_len: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| RangeError::InvalidCidr(s.to_string()))?;
        Ok(Self::new(addr, prefix_len))
    }
}

/// An inclusive `start..=end` IPv4 address range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl IpRange {
    /// Build a range, rejecting reversed or oversized ones
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, RangeError> {
        if u32::from(start) > u32::from(end) {
            return Err(RangeError::Reversed { start, end });
        }
        let len = u64::from(u32::from(end) - u32::from(start)) + 1;
        if len > MAX_RANGE_ADDRESSES {
            return Err(RangeError::TooLarge(len));
        }
        Ok(Self { start, end })
    }

    /// Parse both endpoints from text
    pub fn parse(start: &str, end: &str) -> Result<Self, RangeError> {
        let start = Ipv4Addr::from_str(start.trim())
            .map_err(|_| RangeError::InvalidAddress(start.to_string()))?;
        let end = Ipv4Addr::from_str(end.trim())
            .map_err(|_| RangeError::InvalidAddress(end.to_string()))?;
        Self::new(start, end)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        ip >= u32::from(self.start) && ip <= u32::from(self.end)
    }

    /// Number of addresses, endpoints included
    pub fn len(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start)) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Addresses in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
