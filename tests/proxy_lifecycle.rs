//! Supervisor-level end-to-end: config in, packets through, ordered teardown.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use sproxy::engine::EngineConfig;
use sproxy::packet::{self, TcpFlags, TcpSegment};
use sproxy::sim::{channel_tun, psk_of, PipeConnector, SimRelay};
use sproxy::supervisor::{LifecycleState, Supervisor};

const DEVICE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
const SRC_PORT: u16 = 50000;
const DST_PORT: u16 = 443;

fn device_segment(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    packet::build_tcp_packet(
        DEVICE,
        REMOTE,
        SRC_PORT,
        DST_PORT,
        seq,
        ack,
        TcpFlags::of(flags),
        payload,
    )
}

async fn next_segment(replies: &mut mpsc::Receiver<Vec<u8>>) -> TcpSegment {
    let raw = timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("reply within deadline")
        .expect("tun writer alive");
    let ip = packet::parse_ipv4(&raw).unwrap();
    packet::parse_tcp(&ip.payload).unwrap()
}

#[tokio::test]
async fn full_session_through_the_supervisor() {
    let relay = SimRelay::new(psk_of(2)).echo_payload();
    let (tun, inject, mut replies) = channel_tun();
    let supervisor = Supervisor::new();
    supervisor
        .start_with_connector(
            Arc::new(PipeConnector::new(relay.clone())),
            psk_of(2),
            tun,
            EngineConfig::default(),
        )
        .await
        .unwrap();
    assert_eq!(supervisor.state(), LifecycleState::Running);

    inject
        .send(device_segment(100, 0, TcpFlags::SYN, &[]))
        .await
        .unwrap();
    let syn_ack = next_segment(&mut replies).await;
    assert!(syn_ack.flags.syn() && syn_ack.flags.ack());
    assert_eq!(syn_ack.ack, 101);
    let isn = syn_ack.seq;
    inject
        .send(device_segment(101, isn.wrapping_add(1), TcpFlags::ACK, &[]))
        .await
        .unwrap();

    let request = b"GET / HTTP/1.1\r\n\r\n";
    inject
        .send(device_segment(
            101,
            isn.wrapping_add(1),
            TcpFlags::PSH | TcpFlags::ACK,
            request,
        ))
        .await
        .unwrap();

    // One ACK for our payload, one echoed data segment; order is free.
    let mut saw_ack = false;
    let mut saw_echo = false;
    while !(saw_ack && saw_echo) {
        let seg = next_segment(&mut replies).await;
        if seg.payload.is_empty() {
            assert_eq!(seg.ack, 101 + request.len() as u32);
            saw_ack = true;
        } else {
            assert_eq!(seg.payload, request);
            assert!(seg.flags.psh() && seg.flags.ack());
            saw_echo = true;
        }
    }
    assert_eq!(
        relay.connect_targets(),
        vec![format!("{REMOTE}:{DST_PORT}")]
    );

    supervisor.stop().await;
    assert_eq!(supervisor.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn stop_mid_flow_tears_down_cleanly() {
    let relay = SimRelay::new(psk_of(2));
    let (tun, inject, mut replies) = channel_tun();
    let supervisor = Supervisor::new();
    supervisor
        .start_with_connector(
            Arc::new(PipeConnector::new(relay)),
            psk_of(2),
            tun,
            EngineConfig::default(),
        )
        .await
        .unwrap();

    inject
        .send(device_segment(100, 0, TcpFlags::SYN, &[]))
        .await
        .unwrap();
    let syn_ack = next_segment(&mut replies).await;
    inject
        .send(device_segment(
            101,
            syn_ack.seq.wrapping_add(1),
            TcpFlags::ACK,
            &[],
        ))
        .await
        .unwrap();

    // Stop with the flow still established; teardown must not hang.
    timeout(Duration::from_secs(10), supervisor.stop())
        .await
        .expect("stop within deadline");
    assert_eq!(supervisor.state(), LifecycleState::Stopped);

    // A second stop is a no-op.
    supervisor.stop().await;
    assert_eq!(supervisor.state(), LifecycleState::Stopped);
}
