//! Packet engine: the pump between the TUN device and the relay sessions.
//!
//! One loop reads IPv4 packets off the TUN and dispatches by protocol. TCP is
//! terminated locally: a SYN acquires a pooled session, issues CONNECT, and
//! answers with SYN-ACK; payload is forwarded through the session and ACKed;
//! a per-flow forwarder task replays peer bytes as PSH+ACK segments. UDP/53
//! is forwarded to the upstream resolver; everything else is dropped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::flow::{FlowKey, FlowTable, TcpFlow, TcpFlowState};
use crate::packet::{self, Ipv4Packet, TcpFlags, TcpSegment, IPPROTO_TCP, IPPROTO_UDP};
use crate::pool::SessionPool;
use crate::session::SecureSession;

pub mod dns;
pub mod tun;

pub use dns::DnsForwarder;
pub use tun::{TunDevice, TunInterface};

/// Backoff after an empty TUN read, so the loop does not spin.
const IDLE_READ_SLEEP: Duration = Duration::from_millis(10);
/// IPv4 + TCP header bytes taken out of the MTU for segment payload.
const IP_TCP_OVERHEAD: usize = 40;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub mtu: usize,
    pub dns_upstream: SocketAddr,
    /// Deadline for the whole SYN-time acquire + CONNECT exchange.
    pub connect_timeout: Duration,
    pub dns_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            dns_upstream: "8.8.8.8:53".parse().expect("static addr"),
            connect_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// A TUN write failed; the engine cannot continue.
    #[error("tun write failed: {0}")]
    TunWrite(String),
}

#[derive(Default)]
struct EngineStats {
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

struct Shared {
    tun: Arc<dyn TunInterface>,
    pool: Arc<SessionPool>,
    flows: Arc<FlowTable>,
    dns: DnsForwarder,
    config: EngineConfig,
    cancel: CancellationToken,
    stats: EngineStats,
    write_error: Mutex<Option<String>>,
}

impl Shared {
    /// Serialised reply write. A failure is fatal: it records the error and
    /// cancels the engine.
    async fn write_to_tun(&self, packet: &[u8]) -> bool {
        match self.tun.send_packet(packet).await {
            Ok(()) => true,
            Err(e) => {
                {
                    let mut err = self.write_error.lock();
                    if err.is_none() {
                        *err = Some(e.to_string());
                    }
                }
                warn!(target: "sproxy::engine", error = %e, "tun write failed, aborting engine");
                self.cancel.cancel();
                false
            }
        }
    }
}

/// The TUN-side packet pump. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct PacketEngine {
    shared: Arc<Shared>,
}

impl PacketEngine {
    pub fn new(
        tun: Arc<dyn TunInterface>,
        pool: Arc<SessionPool>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let dns = DnsForwarder::new(config.dns_upstream, config.dns_timeout);
        Self {
            shared: Arc::new(Shared {
                tun,
                pool,
                flows: Arc::new(FlowTable::new()),
                dns,
                config,
                cancel,
                stats: EngineStats::default(),
                write_error: Mutex::new(None),
            }),
        }
    }

    pub fn flows(&self) -> &FlowTable {
        &self.shared.flows
    }

    /// Payload bytes forwarded device → relay.
    pub fn bytes_up(&self) -> u64 {
        self.shared.stats.bytes_up.load(Ordering::Relaxed)
    }

    /// Payload bytes forwarded relay → device.
    pub fn bytes_down(&self) -> u64 {
        self.shared.stats.bytes_down.load(Ordering::Relaxed)
    }

    /// Runs the read loop until cancellation or a fatal TUN write error,
    /// then drains every flow.
    pub async fn run(&self) -> Result<(), EngineError> {
        info!(target: "sproxy::engine", mtu = self.shared.config.mtu, "engine started");
        let mut buf = vec![0u8; self.shared.config.mtu];
        loop {
            let n = tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                read = self.shared.tun.recv_packet(&mut buf) => match read {
                    Ok(0) => {
                        sleep(IDLE_READ_SLEEP).await;
                        continue;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        warn!(target: "sproxy::engine", error = %e, "tun read failed");
                        sleep(IDLE_READ_SLEEP).await;
                        continue;
                    }
                },
            };
            handle_packet(&self.shared, &buf[..n]).await;
            if self.shared.cancel.is_cancelled() {
                break;
            }
        }
        self.drain_flows();
        info!(target: "sproxy::engine", "engine stopped");
        match self.shared.write_error.lock().take() {
            Some(reason) => Err(EngineError::TunWrite(reason)),
            None => Ok(()),
        }
    }

    /// Tears down every flow: forwarders aborted, sessions released.
    pub fn drain_flows(&self) {
        for flow in self.shared.flows.drain() {
            flow.mark_dead();
            if let Some(handle) = flow.take_forwarder() {
                handle.abort();
            }
            if let Some(session) = flow.take_session() {
                self.shared.pool.release(session);
            }
            flow.advance(TcpFlowState::Closed);
        }
    }
}

async fn handle_packet(shared: &Arc<Shared>, buf: &[u8]) {
    // Non-IPv4 is dropped without comment; the TUN is configured IPv4-only.
    let Ok(ip) = packet::parse_ipv4(buf) else {
        return;
    };
    match ip.protocol {
        IPPROTO_TCP => match packet::parse_tcp(&ip.payload) {
            Ok(seg) => handle_tcp(shared, &ip, seg).await,
            Err(e) => debug!(target: "sproxy::engine", error = %e, "bad tcp segment"),
        },
        IPPROTO_UDP => match packet::parse_udp(&ip.payload) {
            Ok(dgram) if dgram.dst_port == 53 => {
                let shared = shared.clone();
                let (src, dst) = (ip.src, ip.dst);
                tokio::spawn(async move {
                    if let Some(response) = shared.dns.resolve(&dgram.payload, dgram.src_port).await
                    {
                        let reply =
                            packet::build_udp_packet(dst, src, 53, dgram.src_port, &response);
                        shared.write_to_tun(&reply).await;
                    }
                });
            }
            Ok(dgram) => {
                debug!(target: "sproxy::engine", dst_port = dgram.dst_port, "non-dns udp dropped")
            }
            Err(e) => debug!(target: "sproxy::engine", error = %e, "bad udp datagram"),
        },
        other => {
            debug!(target: "sproxy::engine", protocol = other, "unsupported protocol dropped")
        }
    }
}

async fn handle_tcp(shared: &Arc<Shared>, ip: &Ipv4Packet, seg: TcpSegment) {
    let key = FlowKey {
        src_port: seg.src_port,
        dst_ip: ip.dst,
        dst_port: seg.dst_port,
    };

    if seg.flags.syn() && !seg.flags.ack() {
        match shared.flows.create(key, ip.src) {
            Some(flow) => spawn_connect(shared.clone(), flow, seg),
            // The device retransmitted a SYN we are already connecting for.
            None => debug!(target: "sproxy::engine", flow = %key, "duplicate syn dropped"),
        }
        return;
    }

    let Some(flow) = shared.flows.get(&key) else {
        if !seg.flags.rst() {
            debug!(target: "sproxy::engine", flow = %key, "segment for unknown flow, sending rst");
            let ack = seg
                .seq
                .wrapping_add(seg.payload.len() as u32)
                .wrapping_add(u32::from(seg.flags.fin()));
            let rst = packet::build_tcp_packet(
                ip.dst,
                ip.src,
                seg.dst_port,
                seg.src_port,
                if seg.flags.ack() { seg.ack } else { 0 },
                ack,
                TcpFlags::of(TcpFlags::RST | TcpFlags::ACK),
                &[],
            );
            shared.write_to_tun(&rst).await;
        }
        return;
    };

    if seg.flags.rst() {
        debug!(target: "sproxy::engine", flow = %key, "rst from device");
        teardown(shared, &flow, true);
        return;
    }

    // An ACK while SYN-RECEIVED completes the three-way handshake, whether
    // or not the same segment already carries data.
    if seg.flags.ack() && flow.state() == TcpFlowState::SynReceived {
        if flow.advance(TcpFlowState::Established) {
            debug!(target: "sproxy::engine", flow = %key, "flow established");
        }
    }

    let payload_len = seg.payload.len() as u32;
    if !seg.payload.is_empty() && flow.state() == TcpFlowState::Established {
        let Some(session) = flow.session() else {
            send_flow_rst(shared, &flow).await;
            teardown(shared, &flow, true);
            return;
        };
        match session.send(&seg.payload).await {
            Ok(()) => {
                shared
                    .stats
                    .bytes_up
                    .fetch_add(u64::from(payload_len), Ordering::Relaxed);
                let ack_no = flow.advance_client_seq(payload_len);
                let ack = packet::build_tcp_packet(
                    ip.dst,
                    ip.src,
                    seg.dst_port,
                    seg.src_port,
                    flow.server_seq(),
                    ack_no,
                    TcpFlags::of(TcpFlags::ACK),
                    &[],
                );
                shared.write_to_tun(&ack).await;
            }
            Err(e) => {
                warn!(target: "sproxy::engine", flow = %key, error = %e, "forward failed");
                send_flow_rst(shared, &flow).await;
                teardown(shared, &flow, true);
                return;
            }
        }
    }

    if seg.flags.fin() {
        let fin_ack = seg.seq.wrapping_add(payload_len).wrapping_add(1);
        match flow.state() {
            TcpFlowState::CloseWait => {
                // Our FIN is already out; acknowledge theirs and finish.
                let ack = packet::build_tcp_packet(
                    ip.dst,
                    ip.src,
                    seg.dst_port,
                    seg.src_port,
                    flow.server_seq(),
                    fin_ack,
                    TcpFlags::of(TcpFlags::ACK),
                    &[],
                );
                shared.write_to_tun(&ack).await;
                teardown(shared, &flow, true);
            }
            TcpFlowState::LastAck | TcpFlowState::Closed => {}
            _ => {
                let seq = flow.server_seq();
                let ack = packet::build_tcp_packet(
                    ip.dst,
                    ip.src,
                    seg.dst_port,
                    seg.src_port,
                    seq,
                    fin_ack,
                    TcpFlags::of(TcpFlags::ACK),
                    &[],
                );
                shared.write_to_tun(&ack).await;
                let fin = packet::build_tcp_packet(
                    ip.dst,
                    ip.src,
                    seg.dst_port,
                    seg.src_port,
                    seq,
                    fin_ack,
                    TcpFlags::of(TcpFlags::FIN | TcpFlags::ACK),
                    &[],
                );
                shared.write_to_tun(&fin).await;
                flow.advance_server_seq(1);
                if let Some(handle) = flow.take_forwarder() {
                    handle.abort();
                }
                if let Some(session) = flow.take_session() {
                    shared.pool.release(session);
                }
                if !flow.advance(TcpFlowState::LastAck) {
                    // FIN before the handshake finished; nothing to wait for.
                    teardown(shared, &flow, false);
                }
            }
        }
        return;
    }

    if seg.flags.ack()
        && flow.state() == TcpFlowState::LastAck
        && seg.ack == flow.server_seq()
    {
        flow.advance(TcpFlowState::Closed);
        shared.flows.remove(&key);
        debug!(target: "sproxy::engine", flow = %key, "flow closed");
    }
}

/// SYN-time work runs off the read loop: acquire a session, CONNECT, answer
/// with SYN-ACK, and start the peer→device forwarder.
fn spawn_connect(shared: Arc<Shared>, flow: Arc<TcpFlow>, seg: TcpSegment) {
    tokio::spawn(async move {
        let key = flow.key();
        let device_ip = flow.device_ip();
        let attempt = timeout(shared.config.connect_timeout, async {
            let session = shared.pool.acquire().await?;
            match session
                .send_connect(&key.dst_ip.to_string(), key.dst_port)
                .await
            {
                Ok(()) => Ok(session),
                Err(e) => {
                    // The session itself may still be healthy; the relay
                    // just refused this target.
                    shared.pool.release(session);
                    Err(e)
                }
            }
        })
        .await;

        match attempt {
            Ok(Ok(session)) => {
                let isn = OsRng.next_u32();
                flow.attach_session(session.clone());
                flow.init_seqs(seg.seq.wrapping_add(1), isn.wrapping_add(1));
                let syn_ack = packet::build_tcp_packet(
                    key.dst_ip,
                    device_ip,
                    key.dst_port,
                    key.src_port,
                    isn,
                    seg.seq.wrapping_add(1),
                    TcpFlags::of(TcpFlags::SYN | TcpFlags::ACK),
                    &[],
                );
                if !shared.write_to_tun(&syn_ack).await {
                    return;
                }
                let handle = spawn_forwarder(shared.clone(), key, session);
                flow.set_forwarder(handle);
                debug!(target: "sproxy::engine", flow = %key, "syn-ack sent");
            }
            Ok(Err(e)) => {
                warn!(target: "sproxy::engine", flow = %key, error = %e, "connect failed");
                reject_syn(&shared, &flow, &seg).await;
            }
            Err(_) => {
                warn!(target: "sproxy::engine", flow = %key, "connect timed out");
                reject_syn(&shared, &flow, &seg).await;
            }
        }
    });
}

async fn reject_syn(shared: &Arc<Shared>, flow: &Arc<TcpFlow>, seg: &TcpSegment) {
    let key = flow.key();
    let rst = packet::build_tcp_packet(
        key.dst_ip,
        flow.device_ip(),
        key.dst_port,
        key.src_port,
        0,
        seg.seq.wrapping_add(1),
        TcpFlags::of(TcpFlags::RST | TcpFlags::ACK),
        &[],
    );
    shared.write_to_tun(&rst).await;
    teardown(shared, flow, false);
}

/// Peer→device forwarder: owns the session's recv loop for one flow.
///
/// Holds only the flow key and looks the flow up per delivery, so the table
/// keeps sole ownership of the flow itself.
fn spawn_forwarder(shared: Arc<Shared>, key: FlowKey, session: SecureSession) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mss = shared.config.mtu.saturating_sub(IP_TCP_OVERHEAD).max(1);
        loop {
            let delivery = tokio::select! {
                _ = shared.cancel.cancelled() => return,
                delivery = session.recv() => delivery,
            };
            let Some(flow) = shared.flows.get(&key) else {
                return;
            };
            match delivery {
                Ok(Some(data)) if !data.is_empty() => {
                    // Nothing reaches the device before the handshake's bare ACK.
                    tokio::select! {
                        _ = shared.cancel.cancelled() => return,
                        _ = flow.wait_established() => {}
                    }
                    for chunk in data.chunks(mss) {
                        let pkt = packet::build_tcp_packet(
                            key.dst_ip,
                            flow.device_ip(),
                            key.dst_port,
                            key.src_port,
                            flow.server_seq(),
                            flow.client_seq(),
                            TcpFlags::of(TcpFlags::PSH | TcpFlags::ACK),
                            chunk,
                        );
                        if !shared.write_to_tun(&pkt).await {
                            return;
                        }
                        flow.advance_server_seq(chunk.len() as u32);
                        shared
                            .stats
                            .bytes_down
                            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                }
                // A zero-length read or transport EOF both mean the peer is done.
                Ok(Some(_)) | Ok(None) => {
                    if flow.is_established() && flow.state() == TcpFlowState::Established {
                        debug!(target: "sproxy::engine", flow = %key, "peer eof, closing");
                        let fin = packet::build_tcp_packet(
                            key.dst_ip,
                            flow.device_ip(),
                            key.dst_port,
                            key.src_port,
                            flow.server_seq(),
                            flow.client_seq(),
                            TcpFlags::of(TcpFlags::FIN | TcpFlags::ACK),
                            &[],
                        );
                        let _ = shared.write_to_tun(&fin).await;
                        flow.advance_server_seq(1);
                        flow.advance(TcpFlowState::CloseWait);
                        // The remaining FIN/ACK exchange needs no relay.
                        if let Some(session) = flow.take_session() {
                            shared.pool.release(session);
                        }
                        let _ = flow.take_forwarder();
                    } else {
                        send_flow_rst(&shared, &flow).await;
                        teardown(&shared, &flow, false);
                    }
                    return;
                }
                Err(e) => {
                    warn!(target: "sproxy::engine", flow = %key, error = %e, "session failed mid-flow");
                    send_flow_rst(&shared, &flow).await;
                    teardown(&shared, &flow, false);
                    return;
                }
            }
        }
    })
}

async fn send_flow_rst(shared: &Arc<Shared>, flow: &Arc<TcpFlow>) {
    let key = flow.key();
    let rst = packet::build_tcp_packet(
        key.dst_ip,
        flow.device_ip(),
        key.dst_port,
        key.src_port,
        flow.server_seq(),
        flow.client_seq(),
        TcpFlags::of(TcpFlags::RST | TcpFlags::ACK),
        &[],
    );
    shared.write_to_tun(&rst).await;
}

/// Removes a flow and returns its borrowed resources. `abort_forwarder` is
/// false when called from inside the forwarder itself.
fn teardown(shared: &Arc<Shared>, flow: &Arc<TcpFlow>, abort_forwarder: bool) {
    flow.mark_dead();
    if let Some(handle) = flow.take_forwarder() {
        if abort_forwarder {
            handle.abort();
        }
    }
    if let Some(session) = flow.take_session() {
        shared.pool.release(session);
    }
    flow.advance(TcpFlowState::Closed);
    shared.flows.remove(&flow.key());
}
