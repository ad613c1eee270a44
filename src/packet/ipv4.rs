//! IPv4 header parsing and emission.

use std::net::Ipv4Addr;

use super::{ones_complement, PacketError};

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

const MIN_HEADER_LEN: usize = 20;

/// A parsed IPv4 packet. The payload is owned; reply construction never
/// aliases the inbound buffer.
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub header_len: usize,
    pub total_len: usize,
    pub payload: Vec<u8>,
}

/// Parses an IPv4 packet as delivered by the TUN device.
///
/// Options are skipped by honouring IHL. The header checksum is not verified;
/// the kernel accepted the packet before handing it to us.
pub fn parse_ipv4(buf: &[u8]) -> Result<Ipv4Packet, PacketError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(PacketError::Truncated("ipv4"));
    }
    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::NotIpv4(version));
    }
    let header_len = usize::from(buf[0] & 0x0f) * 4;
    if header_len < MIN_HEADER_LEN || buf.len() < header_len {
        return Err(PacketError::BadHeaderLength);
    }
    let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let end = total_len.clamp(header_len, buf.len());
    let protocol = buf[9];
    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    Ok(Ipv4Packet {
        src,
        dst,
        protocol,
        header_len,
        total_len,
        payload: buf[header_len..end].to_vec(),
    })
}

/// Builds a complete IPv4 packet around `payload`.
///
/// Fixed emission policy: IHL=5 (no options), identification 0 with DF set,
/// TTL 64, checksum computed over the 20-byte header.
pub fn build_ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let total_len = MIN_HEADER_LEN + payload.len();
    let mut packet = Vec::with_capacity(total_len);
    packet.push(0x45); // version 4, IHL 5
    packet.push(0x00); // DSCP/ECN
    packet.extend_from_slice(&(total_len as u16).to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes()); // identification
    packet.extend_from_slice(&0x4000u16.to_be_bytes()); // DF, fragment offset 0
    packet.push(64); // TTL
    packet.push(protocol);
    packet.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());
    let checksum = ones_complement(&packet[..MIN_HEADER_LEN]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}
