//! IPv4 packet codec for the TUN side.
//!
//! Parsing is tolerant where the kernel already did the work (input checksums
//! are not re-verified) and strict where we would otherwise misread a header.
//! Emission always builds a fresh buffer; reply packets never mutate the
//! buffer they answer.

use thiserror::Error;

mod ipv4;
mod tcp;
mod udp;

pub use ipv4::{build_ipv4_packet, parse_ipv4, Ipv4Packet, IPPROTO_TCP, IPPROTO_UDP};
pub use tcp::{build_tcp_packet, parse_tcp, TcpFlags, TcpSegment};
pub use udp::{build_udp_packet, parse_udp, UdpDatagram};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short for {0} header")]
    Truncated(&'static str),
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("header length field inconsistent with buffer")]
    BadHeaderLength,
}

/// One's-complement checksum over `data`, as used by IPv4, TCP and UDP.
///
/// A trailing odd byte is padded with zero on the right.
pub(crate) fn ones_complement(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of a TCP or UDP segment including the IPv4 pseudo-header.
pub(crate) fn transport_checksum(
    src: std::net::Ipv4Addr,
    dst: std::net::Ipv4Addr,
    protocol: u8,
    segment: &[u8],
) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + segment.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(protocol);
    pseudo.extend_from_slice(&(segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(segment);
    ones_complement(&pseudo)
}
