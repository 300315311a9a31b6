//! ICMP echo probing via the system `ping` and reverse hostname lookup

use async_trait::async_trait;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};

/// Timeout for a reverse DNS lookup
const HOSTNAME_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of one echo round against one host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    pub online: bool,
    /// Average round-trip time over the replies received
    pub response_time_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub message: String,
}

impl ProbeResult {
    /// Unreachable host: offline with total loss
    pub fn offline(message: impl Into<String>) -> Self {
        Self {
            online: false,
            response_time_ms: None,
            min_ms: None,
            max_ms: None,
            packet_loss_pct: 100.0,
            message: message.into(),
        }
    }

    /// Build a result for a successful run that sent `count` echoes.
    ///
    /// `samples` are the parsed round-trip times. An empty list (output in a
    /// format we cannot read) counts every echo as answered without timings.
    pub fn from_samples(count: u32, samples: &[f64]) -> Self {
        let count = count.max(1);
        let success = if samples.is_empty() {
            count
        } else {
            (samples.len() as u32).min(count)
        };
        let packet_loss_pct = f64::from(count - success) / f64::from(count) * 100.0;

        let (avg, min, max) = if samples.is_empty() {
            (None, None, None)
        } else {
            let sum: f64 = samples.iter().sum();
            let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (Some(sum / samples.len() as f64), Some(min), Some(max))
        };

        Self {
            online: true,
            response_time_ms: avg,
            min_ms: min,
            max_ms: max,
            packet_loss_pct,
            message: format!("{}/{} echo replies received", success, count),
        }
    }
}

/// Reachability and name resolution for one host
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send `count` echo requests, each waiting up to `timeout`.
    ///
    /// An unreachable host is a normal outcome, reported as offline.
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration, count: u32) -> ProbeResult;

    /// Reverse-resolve `ip`; `None` when no name is known
    async fn resolve_hostname(&self, ip: Ipv4Addr) -> Option<String> {
        reverse_lookup(ip, HOSTNAME_LOOKUP_TIMEOUT).await
    }
}

/// Prober backed by the operating system's `ping` binary
#[derive(Debug, Clone, Default)]
pub struct SystemPinger;

#[async_trait]
impl Prober for SystemPinger {
    async fn probe(&self, ip: Ipv4Addr, timeout: Duration, count: u32) -> ProbeResult {
        let count = count.max(1);
        let deadline = timeout * count + Duration::from_secs(1);

        let result = tokio::time::timeout(
            deadline,
            Command::new("ping")
                .args(ping_args(ip, timeout, count))
                .kill_on_drop(true)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let samples = parse_ping_times(&stdout);
                trace!(ip = %ip, replies = samples.len(), "Host answered");
                ProbeResult::from_samples(count, &samples)
            }
            Ok(Ok(_)) => ProbeResult::offline("Host unreachable"),
            Ok(Err(e)) => {
                debug!(ip = %ip, error = %e, "Failed to run ping");
                ProbeResult::offline(format!("Failed to run ping: {}", e))
            }
            Err(_) => ProbeResult::offline("Ping timed out"),
        }
    }
}

/// Arguments for one bounded `ping` round
#[cfg(target_os = "windows")]
pub fn ping_args(ip: Ipv4Addr, timeout: Duration, count: u32) -> Vec<String> {
    vec![
        "-n".to_string(),
        count.to_string(),
        "-w".to_string(),
        timeout.as_millis().to_string(),
        ip.to_string(),
    ]
}

/// Arguments for one bounded `ping` round
#[cfg(target_os = "linux")]
pub fn ping_args(ip: Ipv4Addr, timeout: Duration, count: u32) -> Vec<String> {
    let mut args = vec![
        "-n".to_string(),
        "-c".to_string(),
        count.to_string(),
        "-W".to_string(),
        timeout.as_secs().max(1).to_string(),
    ];
    if count > 1 {
        args.extend(["-i".to_string(), "0.2".to_string()]);
    }
    args.push(ip.to_string());
    args
}

/// Arguments for one bounded `ping` round
#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn ping_args(ip: Ipv4Addr, timeout: Duration, count: u32) -> Vec<String> {
    // BSD/macOS ping takes -W in milliseconds
    vec![
        "-n".to_string(),
        "-c".to_string(),
        count.to_string(),
        "-W".to_string(),
        timeout.as_millis().to_string(),
        ip.to_string(),
    ]
}

/// Extract round-trip times in milliseconds from `ping` output.
///
/// Understands `time=0.045 ms`, `time=12ms` and `time<1ms`.
pub fn parse_ping_times(output: &str) -> Vec<f64> {
    let mut samples = Vec::new();
    for line in output.lines() {
        let Some(idx) = line.find("time=").or_else(|| line.find("time<")) else {
            continue;
        };
        let value: String = line[idx + 5..]
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(ms) = value.parse::<f64>() {
            samples.push(ms);
        }
    }
    samples
}

/// Reverse DNS lookup on a blocking thread, bounded by `timeout`
pub async fn reverse_lookup(ip: Ipv4Addr, timeout: Duration) -> Option<String> {
    let addr = IpAddr::V4(ip);
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr));

    match tokio::time::timeout(timeout, lookup).await {
        Ok(Ok(Ok(name))) if !name.is_empty() && name != ip.to_string() => Some(name),
        Ok(Ok(Ok(_))) => None,
        Ok(Ok(Err(e))) => {
            trace!(ip = %ip, error = %e, "Reverse lookup failed");
            None
        }
        Ok(Err(e)) => {
            debug!(ip = %ip, error = %e, "Reverse lookup task failed");
            None
        }
        Err(_) => {
            trace!(ip = %ip, "Reverse lookup timed out");
            None
        }
    }
}
