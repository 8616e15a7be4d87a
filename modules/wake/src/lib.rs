//! Wake-on-LAN magic packets.

use anyhow::Result;
use avtool_core::{AvError, AvResult};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::info;

pub const WOL_PORT: u16 = 9;
pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// Parse `AA:BB:CC:DD:EE:FF` or `aa-bb-cc-dd-ee-ff`.
pub fn parse_mac(s: &str) -> AvResult<[u8; 6]> {
    let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return Err(AvError::invalid(format!("bad mac: {}", s)));
    }
    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(&parts) {
        if part.len() != 2 {
            return Err(AvError::invalid(format!("bad mac: {}", s)));
        }
        *slot = u8::from_str_radix(part, 16).map_err(|_| AvError::invalid(format!("bad mac: {}", s)))?;
    }
    Ok(mac)
}

/// Six 0xFF bytes followed by the MAC repeated sixteen times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; MAGIC_PACKET_LEN] {
    let mut pkt = [0xFFu8; MAGIC_PACKET_LEN];
    for chunk in pkt[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    pkt
}

/// Broadcast a magic packet for `mac` to 255.255.255.255:9.
pub async fn send_magic_packet(mac: &str) -> Result<()> {
    let parsed = parse_mac(mac)?;
    send_to(parsed, SocketAddr::from((Ipv4Addr::BROADCAST, WOL_PORT))).await
}

async fn send_to(mac: [u8; 6], target: SocketAddr) -> Result<()> {
    let sock = UdpSocket::bind("0.0.0.0:0").await?;
    sock.set_broadcast(true)?;
    let pkt = magic_packet(mac);
    sock.send_to(&pkt, target).await?;
    info!(dest = %target, "wake packet sent");
    Ok(())
}
