//! In-memory doubles for exercising the pipeline without a network or a TUN
//! device. Used by the unit and scenario test suites.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::crypto::{self, SessionKeys};
use crate::engine::tun::TunInterface;
use crate::session::transport::{FrameSink, FrameSource, TransportConnector};
use crate::session::SessionError;

/// A PSK filled with one repeated byte, handy for pairing sides in tests.
pub fn psk_of(byte: u8) -> [u8; 32] {
    [byte; 32]
}

// ─── In-memory frame transport ───────────────────────────────────────────────

/// Write half of an in-memory transport. Dropping the sender models EOF.
pub struct PipeSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// Read half of an in-memory transport.
pub struct PipeSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Builds a connected transport pair `(client, server)`.
pub fn pipe_pair() -> (
    (Box<dyn FrameSink>, Box<dyn FrameSource>),
    (Box<dyn FrameSink>, Box<dyn FrameSource>),
) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        (
            Box::new(PipeSink { tx: Some(a_tx) }),
            Box::new(PipeSource { rx: b_rx }),
        ),
        (
            Box::new(PipeSink { tx: Some(b_tx) }),
            Box::new(PipeSource { rx: a_rx }),
        ),
    )
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SessionError> {
        match &self.tx {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| SessionError::Transport("pipe closed".into())),
            None => Err(SessionError::Transport("pipe closed".into())),
        }
    }

    async fn send_ping(&mut self) -> Result<(), SessionError> {
        if self.tx.is_none() {
            return Err(SessionError::Transport("pipe closed".into()));
        }
        Ok(())
    }

    async fn send_close(&mut self) -> Result<(), SessionError> {
        self.tx = None;
        Ok(())
    }
}

#[async_trait]
impl FrameSource for PipeSource {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        Ok(self.rx.recv().await)
    }
}

// ─── Scripted relay ──────────────────────────────────────────────────────────

/// A scripted relay endpoint speaking the real wire protocol: mirrored key
/// split, sealed frames, CONNECT verdict byte.
#[derive(Clone)]
pub struct SimRelay {
    psk: [u8; 32],
    refuse: Option<u8>,
    truncate_public: bool,
    close_after_handshake: bool,
    echo: bool,
    push: Vec<Vec<u8>>,
    eof_after_push: bool,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    connects: Arc<Mutex<Vec<String>>>,
}

impl SimRelay {
    pub fn new(psk: [u8; 32]) -> Self {
        Self {
            psk,
            refuse: None,
            truncate_public: false,
            close_after_handshake: false,
            echo: false,
            push: Vec::new(),
            eof_after_push: false,
            received: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Refuse every CONNECT with the given code.
    pub fn refuse_connect(mut self, code: u8) -> Self {
        self.refuse = Some(code);
        self
    }

    /// Send a 16-byte server public to provoke a protocol error.
    pub fn truncate_server_public(mut self) -> Self {
        self.truncate_public = true;
        self
    }

    /// Drop the connection right after a successful handshake.
    pub fn close_after_handshake(mut self) -> Self {
        self.close_after_handshake = true;
        self
    }

    /// Echo every post-CONNECT payload back to the client.
    pub fn echo_payload(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Queue a payload to push to the client once CONNECT succeeds.
    pub fn push_after_connect(mut self, payload: Vec<u8>) -> Self {
        self.push.push(payload);
        self
    }

    /// Close the connection after the queued pushes are sent.
    pub fn eof_after_push(mut self) -> Self {
        self.eof_after_push = true;
        self
    }

    /// Payloads received after CONNECT, in arrival order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    /// CONNECT targets observed, as `host:port` strings.
    pub fn connect_targets(&self) -> Vec<String> {
        self.connects.lock().clone()
    }

    /// Serves one connection until its script is exhausted or the peer goes
    /// away. Runs the server side of the handshake with the mirrored split.
    pub async fn serve(self, mut sink: Box<dyn FrameSink>, mut source: Box<dyn FrameSource>) {
        let Some(client_public) = source.recv_frame().await.ok().flatten() else {
            return;
        };
        if self.truncate_public {
            let _ = sink.send_frame(crypto::random_bytes(16)).await;
            return;
        }
        let server_public = crypto::random_array::<32>();
        if sink.send_frame(server_public.to_vec()).await.is_err() {
            return;
        }

        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(&client_public);
        salt[32..].copy_from_slice(&server_public);
        let derived = crypto::derive_keys(&self.psk, &salt).expect("hkdf");
        // Mirror of the client's split.
        let keys = SessionKeys {
            send: derived.recv,
            recv: derived.send,
        };

        // The auth tag is read but the reply is computed from our own keys;
        // a client with the wrong PSK fails its own comparison.
        if source.recv_frame().await.ok().flatten().is_none() {
            return;
        }
        if sink
            .send_frame(crypto::hmac_tag(&keys.send, b"ok").to_vec())
            .await
            .is_err()
        {
            return;
        }

        if self.close_after_handshake {
            let _ = sink.send_close().await;
            return;
        }

        // CONNECT request.
        let Some(frame) = source.recv_frame().await.ok().flatten() else {
            return;
        };
        let Ok(request) = crypto::open(&keys.recv, &frame) else {
            return;
        };
        if request.len() >= 2 {
            let len = usize::from(u16::from_be_bytes([request[0], request[1]]));
            if let Ok(target) = std::str::from_utf8(&request[2..(2 + len).min(request.len())]) {
                self.connects.lock().push(target.to_string());
            }
        }
        let verdict = self.refuse.unwrap_or(0x00);
        let sealed = crypto::seal(&keys.send, &[verdict]).expect("seal");
        if sink.send_frame(sealed).await.is_err() || self.refuse.is_some() {
            return;
        }

        for payload in &self.push {
            let sealed = crypto::seal(&keys.send, payload).expect("seal");
            if sink.send_frame(sealed).await.is_err() {
                return;
            }
        }
        if self.eof_after_push {
            let _ = sink.send_close().await;
            return;
        }

        while let Ok(Some(frame)) = source.recv_frame().await {
            let Ok(payload) = crypto::open(&keys.recv, &frame) else {
                return;
            };
            self.received.lock().push(payload.clone());
            if self.echo {
                let sealed = crypto::seal(&keys.send, &payload).expect("seal");
                if sink.send_frame(sealed).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// [`TransportConnector`] that wires every connect to a freshly spawned
/// [`SimRelay`] task over an in-memory pipe.
pub struct PipeConnector {
    relay: SimRelay,
}

impl PipeConnector {
    pub fn new(relay: SimRelay) -> Self {
        Self { relay }
    }

    pub fn relay(&self) -> &SimRelay {
        &self.relay
    }
}

#[async_trait]
impl TransportConnector for PipeConnector {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), SessionError> {
        let (client, (server_sink, server_source)) = pipe_pair();
        let relay = self.relay.clone();
        tokio::spawn(relay.serve(server_sink, server_source));
        Ok(client)
    }
}

/// Connector whose dial always fails; models an unreachable relay.
pub struct DeadConnector;

#[async_trait]
impl TransportConnector for DeadConnector {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), SessionError> {
        Err(SessionError::Transport("relay unreachable".into()))
    }
}

// ─── Channel-backed TUN ──────────────────────────────────────────────────────

/// [`TunInterface`] over channels: the test injects device packets into one
/// end and observes engine output on the other.
pub struct ChannelTun {
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    tx: mpsc::Sender<Vec<u8>>,
}

/// Builds a channel TUN plus the test-side handles:
/// `(tun, inject_packets, observe_replies)`.
pub fn channel_tun() -> (Arc<ChannelTun>, mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    let (in_tx, in_rx) = mpsc::channel(256);
    let (out_tx, out_rx) = mpsc::channel(256);
    (
        Arc::new(ChannelTun {
            rx: tokio::sync::Mutex::new(in_rx),
            tx: out_tx,
        }),
        in_tx,
        out_rx,
    )
}

#[async_trait]
impl TunInterface for ChannelTun {
    async fn recv_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            // Injector dropped; idle until the engine is cancelled.
            None => std::future::pending::<io::Result<usize>>().await,
        }
    }

    async fn send_packet(&self, packet: &[u8]) -> io::Result<()> {
        self.tx
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "tun observer gone"))
    }
}
