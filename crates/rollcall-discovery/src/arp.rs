//! Neighbor (ARP) table reading for IP -> MAC resolution

use anyhow::{Context, Result};
use async_trait::async_trait;
use rollcall_core::device::normalize_mac;
use rollcall_core::filter::{is_valid_device_ip, is_valid_device_mac};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Neighbor table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    /// Normalized upper-case colon form
    pub mac: String,
    pub interface: Option<String>,
    pub state: NeighborState,
}

/// Neighbor entry state as reported by `ip neigh`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NeighborState {
    Reachable,
    Stale,
    Delay,
    Probe,
    Failed,
    Incomplete,
    Permanent,
    NoArp,
    Unknown,
}

impl NeighborState {
    /// States that mean the host answered link-layer traffic recently
    pub fn is_active(self) -> bool {
        matches!(self, Self::Reachable | Self::Delay | Self::Permanent)
    }
}

/// Filtered IP -> entry map from one read of the neighbor table
pub type NeighborTable = HashMap<Ipv4Addr, NeighborEntry>;

/// Source of neighbor-table snapshots
#[async_trait]
pub trait NeighborSource: Send + Sync {
    /// Read and filter the whole table once
    async fn read_neighbor_table(&self) -> Result<NeighborTable>;
}

/// Reads the operating system's neighbor table via its CLI tools
#[derive(Debug, Clone)]
pub struct SystemNeighborTable {
    timeout: Duration,
}

impl SystemNeighborTable {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemNeighborTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(target_os = "linux")]
const NEIGHBOR_COMMANDS: &[(&str, &[&str])] = &[("ip", &["neigh", "show"]), ("arp", &["-an"])];

#[cfg(target_os = "windows")]
const NEIGHBOR_COMMANDS: &[(&str, &[&str])] = &[("arp", &["-a"])];

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
const NEIGHBOR_COMMANDS: &[(&str, &[&str])] = &[("arp", &["-an"])];

#[async_trait]
impl NeighborSource for SystemNeighborTable {
    async fn read_neighbor_table(&self) -> Result<NeighborTable> {
        let mut last_error = None;

        for (program, args) in NEIGHBOR_COMMANDS {
            match run_command(program, args, self.timeout).await {
                Ok(stdout) => {
                    let table = parse_neighbor_output(&stdout);
                    debug!(command = %program, entries = table.len(), "Read neighbor table");
                    return Ok(table);
                }
                Err(e) => {
                    warn!(command = %program, error = %e, "Neighbor table command failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No neighbor table command available")))
    }
}

async fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .with_context(|| format!("{} timed out after {:?}", program, timeout))?
    .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        anyhow::bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse full command output into a filtered table.
///
/// Entries with a multicast, broadcast, loopback or link-local IP, or with a
/// broadcast, all-zero or multicast MAC, are dropped. When an IP shows up on
/// several interfaces the entry in an active state wins.
pub fn parse_neighbor_output(output: &str) -> NeighborTable {
    let mut table = NeighborTable::new();

    for line in output.lines() {
        let Some(entry) = parse_neighbor_line(line) else {
            continue;
        };
        if !is_valid_device_ip(entry.ip) || !is_valid_device_mac(&entry.mac) {
            trace!(ip = %entry.ip, mac = %entry.mac, "Filtered neighbor entry");
            continue;
        }

        let replace = table
            .get(&entry.ip)
            .map(|existing| !existing.state.is_active() && entry.state.is_active())
            .unwrap_or(true);
        if replace {
            table.insert(entry.ip, entry);
        }
    }

    table
}

/// Parse one line of `ip neigh`, BSD `arp -an` or Windows `arp -a` output.
///
/// The first token that reads as an IPv4 address (parentheses stripped)
/// and the first later token that reads as a MAC form the pair. Lines
/// without a MAC (incomplete entries, headers) yield `None`.
pub fn parse_neighbor_line(line: &str) -> Option<NeighborEntry> {
    // Linux:   "192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:ff REACHABLE"
    // BSD:     "? (192.168.1.1) at aa:bb:cc:dd:ee:ff on en0 ifscope [ethernet]"
    // Windows: "  192.168.1.1           aa-bb-cc-dd-ee-ff     dynamic"
    let parts: Vec<&str> = line.split_whitespace().collect();

    let ip_idx = parts
        .iter()
        .position(|p| Ipv4Addr::from_str(p.trim_matches(|c| c == '(' || c == ')')).is_ok())?;
    let ip = Ipv4Addr::from_str(parts[ip_idx].trim_matches(|c| c == '(' || c == ')')).ok()?;

    let mac = parts[ip_idx + 1..].iter().find_map(|p| normalize_mac(p))?;

    let interface = parts
        .iter()
        .position(|&p| p == "dev" || p == "on")
        .and_then(|idx| parts.get(idx + 1))
        .map(|s| s.to_string());

    let state = parts
        .last()
        .map(|s| parse_neighbor_state(s))
        .unwrap_or(NeighborState::Unknown);

    Some(NeighborEntry {
        ip,
        mac,
        interface,
        state,
    })
}

fn parse_neighbor_state(s: &str) -> NeighborState {
    match s.to_uppercase().as_str() {
        "REACHABLE" => NeighborState::Reachable,
        "STALE" => NeighborState::Stale,
        "DELAY" => NeighborState::Delay,
        "PROBE" => NeighborState::Probe,
        "FAILED" => NeighborState::Failed,
        "INCOMPLETE" => NeighborState::Incomplete,
        "PERMANENT" | "STATIC" => NeighborState::Permanent,
        "NOARP" => NeighborState::NoArp,
        _ => NeighborState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_neigh_line_reachable() {
        let line = "192.168.1.100 dev eth0 lladdr aa:bb:cc:dd:ee:0f REACHABLE";
        let entry = parse_neighbor_line(line).unwrap();
        assert_eq!(entry.ip, Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(entry.mac, "AA:BB:CC:DD:EE:0F");
        assert_eq!(entry.interface.as_deref(), Some("eth0"));
        assert_eq!(entry.state, NeighborState::Reachable);
    }

    #[test]
    fn test_parse_ip_neigh_line_stale() {
        let line = "192.168.1.100 dev eth0 lladdr aa:bb:cc:dd:ee:0f STALE";
        let entry = parse_neighbor_line(line).unwrap();
        assert_eq!(entry.state, NeighborState::Stale);
        assert!(!entry.state.is_active());
    }

    #[test]
    fn test_parse_incomplete_line() {
        assert!(parse_neighbor_line("192.168.1.100 dev eth0 INCOMPLETE").is_none());
        assert!(parse_neighbor_line("? (192.168.1.7) at (incomplete) on en0 ifscope [ethernet]").is_none());
    }

    #[test]
    fn test_parse_bsd_line() {
        let line = "? (10.0.0.1) at a:b:c:d:e:1 on en0 ifscope [ethernet]";
        let entry = parse_neighbor_line(line).unwrap();
        assert_eq!(entry.ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(entry.mac, "0A:0B:0C:0D:0E:01");
        assert_eq!(entry.interface.as_deref(), Some("en0"));
    }

    #[test]
    fn test_parse_windows_line() {
        let entry = parse_neighbor_line("  192.168.0.20          3c-d9-2b-aa-bb-cc     static").unwrap();
        assert_eq!(entry.mac, "3C:D9:2B:AA:BB:CC");
        assert_eq!(entry.state, NeighborState::Permanent);
        assert!(parse_neighbor_line("Interface: 192.168.0.5 --- 0x3").is_none());
    }

    #[test]
    fn test_parse_ignores_ipv6() {
        let line = "fe80::1 dev eth0 lladdr aa:bb:cc:dd:ee:ff router STALE";
        assert!(parse_neighbor_line(line).is_none());
    }

    #[test]
    fn test_output_filtering() {
        let output = "\
192.168.1.1 dev eth0 lladdr aa:bb:cc:dd:ee:01 REACHABLE
192.168.1.255 dev eth0 lladdr ff:ff:ff:ff:ff:ff PERMANENT
224.0.0.251 dev eth0 lladdr 01:00:5e:00:00:fb NOARP
192.168.1.9 dev eth0 lladdr 01:00:5e:00:00:09 STALE
192.168.1.10 dev eth0 lladdr 00:00:00:00:00:00 STALE
169.254.3.3 dev eth0 lladdr aa:bb:cc:dd:ee:03 STALE
192.168.1.20 dev eth0 INCOMPLETE
192.168.1.30 dev eth0 lladdr aa:bb:cc:dd:ee:30 STALE
";
        let table = parse_neighbor_output(output);
        assert_eq!(table.len(), 2);
        assert_eq!(table[&Ipv4Addr::new(192, 168, 1, 1)].mac, "AA:BB:CC:DD:EE:01");
        assert_eq!(table[&Ipv4Addr::new(192, 168, 1, 30)].mac, "AA:BB:CC:DD:EE:30");
    }

    #[test]
    fn test_output_prefers_active_duplicate() {
        let output = "\
10.0.0.5 dev wlan0 lladdr aa:bb:cc:dd:ee:05 STALE
10.0.0.5 dev eth0 lladdr aa:bb:cc:dd:ee:05 REACHABLE
";
        let table = parse_neighbor_output(output);
        let entry = &table[&Ipv4Addr::new(10, 0, 0, 5)];
        assert_eq!(entry.interface.as_deref(), Some("eth0"));
        assert_eq!(entry.state, NeighborState::Reachable);
    }
}
