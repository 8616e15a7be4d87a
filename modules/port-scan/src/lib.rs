//! TCP connect liveness probes over the ports AV gear tends to listen on.

use anyhow::{anyhow, Result};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Telnet, HTTP(S), Kramer P3000, Lightware LW3, Samsung MDC, PJLink, Crestron CIP.
pub const AV_CANDIDATE_PORTS: [u16; 9] = [23, 80, 443, 8080, 5000, 6100, 1515, 4352, 41794];

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(120);

/// Parse a comma-separated list of ports/ranges (e.g., "23,80", "5000-5002,1515").
/// Order is kept and duplicates dropped, since sweep order is observable.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse()?;
            let e: u16 = end.trim().parse()?;
            if s == 0 || e == 0 || s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            ports.extend(s..=e);
        } else {
            let p: u16 = part.parse()?;
            if p == 0 {
                return Err(anyhow!("invalid port: {}", part));
            }
            ports.push(p);
        }
    }
    Ok(normalize_ports(&ports))
}

/// Drop zeros and repeats; an empty result falls back to [`AV_CANDIDATE_PORTS`].
pub fn normalize_ports(ports: &[u16]) -> Vec<u16> {
    let mut out: Vec<u16> = Vec::with_capacity(ports.len());
    for &p in ports {
        if p != 0 && !out.contains(&p) {
            out.push(p);
        }
    }
    if out.is_empty() {
        out.extend_from_slice(&AV_CANDIDATE_PORTS);
    }
    out
}

/// True if a TCP connection to `addr` is accepted within `per_attempt`.
/// The connection is closed straight away.
pub async fn tcp_probe(addr: SocketAddr, per_attempt: Duration) -> bool {
    matches!(timeout(per_attempt, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostSweep {
    /// Every port was tried; these accepted.
    Complete(Vec<u16>),
    /// Cancellation was observed before the last port.
    Cancelled,
}

/// Probe `ports` on `ip` one after another, in order, pausing `gap` between
/// attempts. Cancellation is checked before each attempt, never during one.
pub async fn sweep_host(
    ip: IpAddr,
    ports: &[u16],
    per_attempt: Duration,
    gap: Duration,
    cancel: &CancellationToken,
) -> HostSweep {
    let mut open = Vec::new();
    for &port in ports {
        if cancel.is_cancelled() {
            return HostSweep::Cancelled;
        }
        if tcp_probe(SocketAddr::new(ip, port), per_attempt).await {
            open.push(port);
        }
        if !gap.is_zero() {
            tokio::time::sleep(gap).await;
        }
    }
    HostSweep::Complete(open)
}
