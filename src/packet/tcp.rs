//! TCP segment parsing and reply emission.

use std::fmt;
use std::net::Ipv4Addr;

use super::ipv4::{build_ipv4_packet, IPPROTO_TCP};
use super::{transport_checksum, PacketError};

const MIN_HEADER_LEN: usize = 20;

/// The six low flag bits of the TCP header.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub const fn of(bits: u8) -> Self {
        Self(bits & 0x3f)
    }

    pub fn fin(self) -> bool {
        self.0 & Self::FIN != 0
    }
    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }
    pub fn rst(self) -> bool {
        self.0 & Self::RST != 0
    }
    pub fn psh(self) -> bool {
        self.0 & Self::PSH != 0
    }
    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }
}

impl fmt::Debug for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::FIN, "FIN"),
            (Self::SYN, "SYN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::ACK, "ACK"),
            (Self::URG, "URG"),
        ] {
            if self.0 & bit != 0 {
                names.push(name);
            }
        }
        write!(f, "TcpFlags({})", names.join("|"))
    }
}

/// A parsed TCP segment (the transport payload of an IPv4 packet).
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// Parses a TCP header and payload. Options are skipped via the data offset;
/// their contents are ignored.
pub fn parse_tcp(buf: &[u8]) -> Result<TcpSegment, PacketError> {
    if buf.len() < MIN_HEADER_LEN {
        return Err(PacketError::Truncated("tcp"));
    }
    let data_offset = usize::from(buf[12] >> 4) * 4;
    if data_offset < MIN_HEADER_LEN || buf.len() < data_offset {
        return Err(PacketError::BadHeaderLength);
    }
    Ok(TcpSegment {
        src_port: u16::from_be_bytes([buf[0], buf[1]]),
        dst_port: u16::from_be_bytes([buf[2], buf[3]]),
        seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        flags: TcpFlags::of(buf[13]),
        window: u16::from_be_bytes([buf[14], buf[15]]),
        payload: buf[data_offset..].to_vec(),
    })
}

/// Builds a full IPv4+TCP packet toward the device.
///
/// Emission policy: no options (data offset 5), window 65535, urgent pointer
/// zero, checksum over the pseudo-header plus segment.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Vec<u8> {
    let mut segment = Vec::with_capacity(MIN_HEADER_LEN + payload.len());
    segment.extend_from_slice(&src_port.to_be_bytes());
    segment.extend_from_slice(&dst_port.to_be_bytes());
    segment.extend_from_slice(&seq.to_be_bytes());
    segment.extend_from_slice(&ack.to_be_bytes());
    segment.push(5 << 4); // data offset 5 words, reserved 0
    segment.push(flags.0);
    segment.extend_from_slice(&65535u16.to_be_bytes());
    segment.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    segment.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
    segment.extend_from_slice(payload);
    let checksum = transport_checksum(src, dst, IPPROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&checksum.to_be_bytes());
    build_ipv4_packet(src, dst, IPPROTO_TCP, &segment)
}
