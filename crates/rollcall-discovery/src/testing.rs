//! Scripted `Prober` and `NeighborSource` fakes for unit tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::arp::{NeighborEntry, NeighborSource, NeighborState, NeighborTable};
use crate::probe::{ProbeResult, Prober};
use crate::session::{DiscoverySession, SessionRegistry};

pub(crate) struct FakeProber {
    online: HashSet<Ipv4Addr>,
    all_online: bool,
    delay: Duration,
    hostnames: HashMap<Ipv4Addr, String>,
}

impl FakeProber {
    pub(crate) fn online(ips: &[&str]) -> Self {
        Self {
            online: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            all_online: false,
            delay: Duration::ZERO,
            hostnames: HashMap::new(),
        }
    }

    pub(crate) fn all_online(delay: Duration) -> Self {
        Self {
            online: HashSet::new(),
            all_online: true,
            delay,
            hostnames: HashMap::new(),
        }
    }

    pub(crate) fn with_hostname(mut self, ip: &str, name: &str) -> Self {
        self.hostnames.insert(ip.parse().unwrap(), name.to_string());
        self
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, ip: Ipv4Addr, _timeout: Duration, count: u32) -> ProbeResult {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.all_online || self.online.contains(&ip) {
            ProbeResult::from_samples(count, &vec![1.5; count.max(1) as usize])
        } else {
            ProbeResult::offline("Host unreachable")
        }
    }

    async fn resolve_hostname(&self, ip: Ipv4Addr) -> Option<String> {
        self.hostnames.get(&ip).cloned()
    }
}

pub(crate) struct FakeNeighbors {
    table: NeighborTable,
    fail: bool,
}

impl FakeNeighbors {
    pub(crate) fn with(entries: &[(&str, &str, NeighborState)]) -> Self {
        let table = entries
            .iter()
            .map(|(ip, mac, state)| {
                let ip: Ipv4Addr = ip.parse().unwrap();
                let entry = NeighborEntry {
                    ip,
                    mac: mac.to_uppercase(),
                    interface: Some("eth0".to_string()),
                    state: *state,
                };
                (ip, entry)
            })
            .collect();
        Self { table, fail: false }
    }

    pub(crate) fn empty() -> Self {
        Self::with(&[])
    }

    pub(crate) fn failing() -> Self {
        Self {
            table: NeighborTable::new(),
            fail: true,
        }
    }
}

#[async_trait]
impl NeighborSource for FakeNeighbors {
    async fn read_neighbor_table(&self) -> anyhow::Result<NeighborTable> {
        if self.fail {
            anyhow::bail!("ip: command not found");
        }
        Ok(self.table.clone())
    }
}

/// Poll until the session reaches a terminal status
pub(crate) async fn wait_for_terminal(registry: &SessionRegistry, id: &str) -> DiscoverySession {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let session = registry.get(id).expect("session exists");
        if session.status.is_terminal() {
            return session;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session {} did not finish: {:?}",
            id,
            session.status
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
