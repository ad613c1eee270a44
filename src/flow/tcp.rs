//! Per-flow TCP state.
//!
//! The engine terminates TCP locally: it answers the device's handshake,
//! acknowledges payload, and replays peer bytes as PSH+ACK segments. This
//! type holds the two sequence cursors and the session handle; the packet
//! decisions themselves live in the engine.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::session::SecureSession;

use super::FlowKey;

/// Server-side view of the flow's TCP state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFlowState {
    /// SYN seen; CONNECT and SYN-ACK may still be in flight.
    SynReceived,
    /// Three-way handshake complete; payload moves both ways.
    Established,
    /// We sent FIN first (peer EOF) and await the device's FIN.
    CloseWait,
    /// Device sent FIN first; we answered FIN+ACK and await its last ACK.
    LastAck,
    Closed,
}

impl TcpFlowState {
    fn can_advance_to(self, next: TcpFlowState) -> bool {
        use TcpFlowState::*;
        matches!(
            (self, next),
            (SynReceived, Established)
                | (Established, CloseWait | LastAck)
                | (SynReceived | Established | CloseWait | LastAck, Closed)
        )
    }
}

/// One TCP connection bridged between the TUN and a relay session.
pub struct TcpFlow {
    key: FlowKey,
    device_ip: Ipv4Addr,
    state: Mutex<TcpFlowState>,
    session: Mutex<Option<SecureSession>>,
    /// Next byte expected from the device.
    client_seq: AtomicU32,
    /// Next byte we will emit toward the device.
    server_seq: AtomicU32,
    alive: AtomicBool,
    established: AtomicBool,
    established_notify: Notify,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl TcpFlow {
    pub fn new(key: FlowKey, device_ip: Ipv4Addr) -> Self {
        Self {
            key,
            device_ip,
            state: Mutex::new(TcpFlowState::SynReceived),
            session: Mutex::new(None),
            client_seq: AtomicU32::new(0),
            server_seq: AtomicU32::new(0),
            alive: AtomicBool::new(true),
            established: AtomicBool::new(false),
            established_notify: Notify::new(),
            forwarder: Mutex::new(None),
        }
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    /// Device-side address, kept for reply packet construction.
    pub fn device_ip(&self) -> Ipv4Addr {
        self.device_ip
    }

    pub fn state(&self) -> TcpFlowState {
        *self.state.lock()
    }

    /// Applies a checked state transition; returns false and leaves the
    /// state untouched on an illegal move.
    pub fn advance(&self, next: TcpFlowState) -> bool {
        let mut state = self.state.lock();
        if state.can_advance_to(next) {
            *state = next;
            if next == TcpFlowState::Established {
                self.established.store(true, Ordering::Release);
                self.established_notify.notify_waiters();
            }
            true
        } else {
            false
        }
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Parks until the three-way handshake completes. The forwarder uses
    /// this so no peer byte reaches the device before the bare ACK.
    pub async fn wait_established(&self) {
        loop {
            let notified = self.established_notify.notified();
            if self.is_established() {
                return;
            }
            notified.await;
        }
    }

    pub fn attach_session(&self, session: SecureSession) {
        *self.session.lock() = Some(session);
    }

    pub fn session(&self) -> Option<SecureSession> {
        self.session.lock().clone()
    }

    /// Removes the session handle so it can be released exactly once.
    pub fn take_session(&self) -> Option<SecureSession> {
        self.session.lock().take()
    }

    /// Seeds both cursors after CONNECT: the device's ISN+1 and our ISN+1.
    pub fn init_seqs(&self, client_next: u32, server_next: u32) {
        self.client_seq.store(client_next, Ordering::Release);
        self.server_seq.store(server_next, Ordering::Release);
    }

    pub fn client_seq(&self) -> u32 {
        self.client_seq.load(Ordering::Acquire)
    }

    pub fn server_seq(&self) -> u32 {
        self.server_seq.load(Ordering::Acquire)
    }

    pub fn advance_client_seq(&self, len: u32) -> u32 {
        self.client_seq.fetch_add(len, Ordering::AcqRel).wrapping_add(len)
    }

    pub fn advance_server_seq(&self, len: u32) -> u32 {
        self.server_seq.fetch_add(len, Ordering::AcqRel).wrapping_add(len)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub fn set_forwarder(&self, handle: JoinHandle<()>) {
        *self.forwarder.lock() = Some(handle);
    }

    /// Takes the forwarder handle, if any; the caller decides whether to
    /// abort or await it.
    pub fn take_forwarder(&self) -> Option<JoinHandle<()>> {
        self.forwarder.lock().take()
    }
}
