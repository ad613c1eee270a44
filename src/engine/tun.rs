//! TUN endpoint seam.
//!
//! Provisioning the interface (address, route, MTU, DNS advertisement) is a
//! host concern; the engine only needs a bidirectional packet pipe. The trait
//! keeps the engine testable against channel-backed doubles.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

/// Bidirectional stream of Ethernet-less IPv4 packets.
///
/// `send_packet` implementations must serialise concurrent writers so packets
/// are never interleaved at the byte level.
#[async_trait]
pub trait TunInterface: Send + Sync {
    /// Reads one packet into `buf`, returning its length.
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes one packet.
    async fn send_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// [`TunInterface`] over a kernel TUN device.
pub struct TunDevice {
    reader: tokio::sync::Mutex<ReadHalf<tun::AsyncDevice>>,
    writer: tokio::sync::Mutex<WriteHalf<tun::AsyncDevice>>,
}

impl TunDevice {
    /// Wraps a device the host already provisioned.
    pub fn new(device: tun::AsyncDevice) -> Self {
        let (reader, writer) = tokio::io::split(device);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// Creates and brings up a device with the proxy's standard addressing
    /// (`10.0.0.2/24`). Routes and DNS advertisement stay with the host.
    pub fn open(mtu: u16) -> Result<Self, tun::Error> {
        let mut config = tun::Configuration::default();
        config
            .address((10, 0, 0, 2))
            .netmask((255, 255, 255, 0))
            .mtu(i32::from(mtu))
            .up();
        let device = tun::create_as_async(&config)?;
        Ok(Self::new(device))
    }
}

#[async_trait]
impl TunInterface for TunDevice {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await
    }

    async fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(packet).await
    }
}
