//! UDP datagram parsing and DNS reply emission.

use std::net::Ipv4Addr;

use super::ipv4::{build_ipv4_packet, IPPROTO_UDP};
use super::PacketError;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Parses a UDP datagram. The inbound checksum is ignored.
pub fn parse_udp(buf: &[u8]) -> Result<UdpDatagram, PacketError> {
    if buf.len() < HEADER_LEN {
        return Err(PacketError::Truncated("udp"));
    }
    let length = usize::from(u16::from_be_bytes([buf[4], buf[5]]));
    let end = length.clamp(HEADER_LEN, buf.len());
    Ok(UdpDatagram {
        src_port: u16::from_be_bytes([buf[0], buf[1]]),
        dst_port: u16::from_be_bytes([buf[2], buf[3]]),
        payload: buf[HEADER_LEN..end].to_vec(),
    })
}

/// Builds a full IPv4+UDP packet. The UDP checksum is left at zero, which
/// IPv4 permits.
pub fn build_udp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = (HEADER_LEN + payload.len()) as u16;
    let mut segment = Vec::with_capacity(usize::from(length));
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&length.to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes());
    segment.extend_from_slice(payload);
    build_ipv4_packet(src, dst, IPPROTO_UDP, &segment)
}
