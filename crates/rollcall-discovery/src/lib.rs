//! Rollcall Discovery - LAN device discovery sessions
//!
//! This crate provides the async discovery machinery:
//! - ICMP reachability probing through the system `ping`
//! - Neighbor (ARP) table reading for IP -> MAC resolution
//! - Batched, cancellable scan sessions that feed the device cache
//! - A service facade exposing the discovery operations

pub mod arp;
pub mod error;
pub mod probe;
pub mod scanner;
pub mod service;
pub mod session;

#[cfg(test)]
mod testing;

pub use arp::{NeighborEntry, NeighborSource, NeighborState, NeighborTable, SystemNeighborTable};
pub use error::DiscoveryError;
pub use probe::{ProbeResult, Prober, SystemPinger};
pub use scanner::{ScanOrchestrator, ScanRequest, ScannerConfig, DEFAULT_BATCH_SIZE};
pub use service::{ArpPair, DiscoveryService, PingReport, ServiceOptions, DEFAULT_PING_COUNT};
pub use session::{DiscoverySession, ScanMode, SessionRegistry, SessionStatus, DEFAULT_SESSION_RETENTION};
