//! Subnet sweep for AV endpoints: host ranges, neighbor-cache lookups and
//! the single-flight [`Scanner`] session.

mod scanner;

pub use scanner::{ScanEvent, ScanOptions, ScanRequest, ScanResult, ScanSnapshot, Scanner};

use avtool_core::{AvError, AvResult};
use ipnet::Ipv4Net;
use std::net::{Ipv4Addr, UdpSocket};

pub const DEFAULT_FROM: u8 = 1;
pub const DEFAULT_TO: u8 = 254;

/// First three octets of a /24-style subnet.
///
/// Accepts `192.168.1`, `192.168.1.77` or CIDR such as `192.168.1.0/24`.
pub fn parse_subnet_base(s: &str) -> AvResult<[u8; 3]> {
    let s = s.trim();
    if s.contains('/') {
        let net: Ipv4Net = s.parse().map_err(|_| AvError::invalid(format!("bad subnet: {}", s)))?;
        let o = net.network().octets();
        return Ok([o[0], o[1], o[2]]);
    }
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 3 && parts.len() != 4 {
        return Err(AvError::invalid(format!("bad subnet: {}", s)));
    }
    let mut base = [0u8; 3];
    for (i, part) in parts.iter().enumerate() {
        let v: u8 = part.parse().map_err(|_| AvError::invalid(format!("bad subnet: {}", s)))?;
        if i < 3 {
            base[i] = v;
        }
    }
    Ok(base)
}

/// Validate a host range inside a /24.
pub fn check_range(from: u8, to: u8) -> AvResult<()> {
    if from == 0 || to > DEFAULT_TO || from > to {
        return Err(AvError::invalid(format!("bad host range {}-{}", from, to)));
    }
    Ok(())
}

pub fn host_range(base: [u8; 3], from: u8, to: u8) -> AvResult<Vec<Ipv4Addr>> {
    check_range(from, to)?;
    Ok((from..=to).map(|h| Ipv4Addr::new(base[0], base[1], base[2], h)).collect())
}

/// The address this host would use to reach the wider network, if any.
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0").ok()?;
    sock.connect("192.0.2.1:9").ok()?;
    match sock.local_addr().ok()?.ip() {
        std::net::IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Hardware address for `ip` from the kernel neighbor cache, uppercased.
pub fn neighbor_mac(ip: Ipv4Addr) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let table = std::fs::read_to_string("/proc/net/arp").ok()?;
        lookup_arp_table(&table, ip)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = ip;
        None
    }
}

/// Parse `/proc/net/arp` content. Incomplete entries (all-zero address) are skipped.
pub fn lookup_arp_table(table: &str, ip: Ipv4Addr) -> Option<String> {
    let wanted = ip.to_string();
    for line in table.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 4 && parts[0] == wanted {
            let mac = parts[3];
            if mac != "00:00:00:00:00:00" {
                return Some(mac.to_uppercase());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_forms() {
        assert_eq!(parse_subnet_base("192.168.1").unwrap(), [192, 168, 1]);
        assert_eq!(parse_subnet_base("10.0.5.77").unwrap(), [10, 0, 5]);
        assert_eq!(parse_subnet_base("172.16.9.0/24").unwrap(), [172, 16, 9]);
        assert!(parse_subnet_base("192.168").is_err());
        assert!(parse_subnet_base("192.168.1.300").is_err());
        assert!(parse_subnet_base("nope/24").is_err());
    }

    #[test]
    fn ranges() {
        let hosts = host_range([10, 1, 2], 3, 5).unwrap();
        assert_eq!(hosts, vec![Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(10, 1, 2, 4), Ipv4Addr::new(10, 1, 2, 5)]);
        assert!(host_range([10, 1, 2], 0, 5).is_err());
        assert!(host_range([10, 1, 2], 9, 5).is_err());
        assert!(host_range([10, 1, 2], 1, 255).is_err());
    }

    #[test]
    fn arp_table_lookup() {
        let table = "IP address       HW type     Flags       HW address            Mask     Device\n\
                     192.168.1.1      0x1         0x2         a4:91:b1:00:11:22     *        eth0\n\
                     192.168.1.40     0x1         0x0         00:00:00:00:00:00     *        eth0\n";
        assert_eq!(lookup_arp_table(table, Ipv4Addr::new(192, 168, 1, 1)).as_deref(), Some("A4:91:B1:00:11:22"));
        assert_eq!(lookup_arp_table(table, Ipv4Addr::new(192, 168, 1, 40)), None);
        assert_eq!(lookup_arp_table(table, Ipv4Addr::new(192, 168, 1, 2)), None);
    }
}
