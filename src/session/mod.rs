//! Secure relay session: one TLS+WebSocket connection with PSK-derived
//! AES-256-GCM framing.
//!
//! A session is cheap to clone; clones share the same underlying transport
//! and state. Connecting performs the four-step handshake (public values,
//! then HMAC proof both ways) under a 60 s deadline, with step-level retries
//! and an outer backoff loop. After that, [`SecureSession::send`] and
//! [`SecureSession::recv`] move sealed frames, a keepalive task pings every
//! 20 s, and an idle watchdog expires the session after 120 s of silence.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError, SessionKeys};

pub mod state;
pub mod transport;

pub use state::{SessionState, SessionStateError};
pub use transport::{FrameSink, FrameSource, TransportConnector, WsConnector};

/// Whole-handshake deadline, covering transport dial and all four steps.
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(60);
/// Read deadline for the first frame of a request/response exchange.
pub const RECV_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for the relay's CONNECT verdict.
pub const CONNECT_REPLY_DEADLINE: Duration = Duration::from_secs(10);
/// WebSocket ping cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
/// Idle limit after which the watchdog closes the session.
pub const IDLE_LIMIT: Duration = Duration::from_secs(120);

const HANDSHAKE_STEP_RETRIES: u32 = 2;
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
const INBOUND_QUEUE: usize = 64;

/// Errors emitted by the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// TLS or WebSocket failure; retriable at the connect layer.
    #[error("transport error: {0}")]
    Transport(String),
    /// Unexpected handshake message size or order; fatal to the session.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// HMAC mismatch in the handshake; fatal and never retried.
    #[error("peer authentication failed")]
    Auth,
    /// The relay refused a CONNECT request with the given code.
    #[error("relay refused connect: code {0:#04x}")]
    Connect(u8),
    #[error("deadline elapsed")]
    Timeout,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<SessionStateError> for SessionError {
    fn from(err: SessionStateError) -> Self {
        SessionError::Protocol(err.to_string())
    }
}

/// One authenticated relay connection carrying opaque encrypted frames.
#[derive(Clone)]
pub struct SecureSession {
    id: u64,
    state: Arc<Mutex<SessionState>>,
    keys: SessionKeys,
    writer: Arc<tokio::sync::Mutex<Box<dyn FrameSink>>>,
    inbound: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    last_activity: Arc<Mutex<Instant>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SecureSession {
    /// Connects and authenticates a fresh session.
    ///
    /// Retries the whole attempt up to 3 times with 1 s / 2 s backoff.
    /// Authentication failures abort immediately; retrying a wrong PSK
    /// cannot succeed.
    pub async fn connect(
        connector: &dyn TransportConnector,
        psk: &[u8; 32],
    ) -> Result<Self, SessionError> {
        let mut last_err = SessionError::Timeout;
        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                sleep(CONNECT_BACKOFF[(attempt - 1) as usize]).await;
            }
            match timeout(HANDSHAKE_DEADLINE, Self::establish(connector, psk)).await {
                Ok(Ok(session)) => {
                    info!(target: "sproxy::session", id = session.id, "session ready");
                    return Ok(session);
                }
                Ok(Err(SessionError::Auth)) => return Err(SessionError::Auth),
                Ok(Err(e)) => {
                    warn!(target: "sproxy::session", attempt, error = %e, "connect attempt failed");
                    last_err = e;
                }
                Err(_) => {
                    warn!(target: "sproxy::session", attempt, "handshake deadline elapsed");
                    last_err = SessionError::Timeout;
                }
            }
        }
        Err(last_err)
    }

    async fn establish(
        connector: &dyn TransportConnector,
        psk: &[u8; 32],
    ) -> Result<Self, SessionError> {
        let mut st = SessionState::Fresh;
        st = st.transition(SessionState::Handshaking)?;
        let mut step_failures = 0;
        let (keys, sink, source) = loop {
            let (mut sink, mut source) = connector.connect().await?;
            match Self::handshake(sink.as_mut(), source.as_mut(), psk).await {
                Ok(keys) => break (keys, sink, source),
                Err(SessionError::Auth) => {
                    let _ = sink.send_close().await;
                    return Err(SessionError::Auth);
                }
                Err(e) if step_failures < HANDSHAKE_STEP_RETRIES => {
                    debug!(target: "sproxy::session", error = %e, "handshake step failed, retrying");
                    let _ = sink.send_close().await;
                    step_failures += 1;
                }
                Err(e) => return Err(e),
            }
        };
        st = st.transition(SessionState::Ready)?;
        Ok(Self::from_parts(st, keys, sink, source))
    }

    /// Runs the four handshake steps on a fresh transport.
    async fn handshake(
        sink: &mut dyn FrameSink,
        source: &mut dyn FrameSource,
        psk: &[u8; 32],
    ) -> Result<SessionKeys, SessionError> {
        let client_public = crypto::random_array::<32>();
        sink.send_frame(client_public.to_vec()).await?;

        let server_public = source
            .recv_frame()
            .await?
            .ok_or_else(|| SessionError::Protocol("transport closed during handshake".into()))?;
        if server_public.len() != 32 {
            return Err(SessionError::Protocol(format!(
                "server public is {} bytes, expected 32",
                server_public.len()
            )));
        }

        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(&client_public);
        salt[32..].copy_from_slice(&server_public);
        let keys = crypto::derive_keys(psk, &salt)?;

        sink.send_frame(crypto::hmac_tag(&keys.send, b"auth").to_vec())
            .await?;
        let proof = source
            .recv_frame()
            .await?
            .ok_or_else(|| SessionError::Protocol("transport closed before auth proof".into()))?;
        let expected = crypto::hmac_tag(&keys.recv, b"ok");
        if proof.len() != 32 || !crypto::ct_eq(&proof, &expected) {
            return Err(SessionError::Auth);
        }
        Ok(keys)
    }

    fn from_parts(
        state: SessionState,
        keys: SessionKeys,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) -> Self {
        let state = Arc::new(Mutex::new(state));
        let writer = Arc::new(tokio::sync::Mutex::new(sink));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);

        let reader = {
            let state = state.clone();
            let last_activity = last_activity.clone();
            let mut source = source;
            tokio::spawn(async move {
                loop {
                    match source.recv_frame().await {
                        Ok(Some(frame)) => {
                            *last_activity.lock() = Instant::now();
                            if tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!(target: "sproxy::session", "transport reached eof");
                            break;
                        }
                        Err(e) => {
                            warn!(target: "sproxy::session", error = %e, "transport read failed");
                            break;
                        }
                    }
                }
                force_closed(&state);
            })
        };

        let keepalive = {
            let state = state.clone();
            let writer = writer.clone();
            let last_activity = last_activity.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if state.lock().is_terminal() {
                        break;
                    }
                    let idle = last_activity.lock().elapsed();
                    if idle >= IDLE_LIMIT {
                        info!(
                            target: "sproxy::session",
                            idle_secs = idle.as_secs(),
                            "idle watchdog expiring session"
                        );
                        {
                            let mut st = state.lock();
                            if let Ok(next) = st.transition(SessionState::Closing) {
                                *st = next;
                            }
                        }
                        let mut w = writer.lock().await;
                        let _ = w.send_close().await;
                        force_closed(&state);
                        break;
                    }
                    let mut w = writer.lock().await;
                    if w.send_ping().await.is_err() {
                        force_closed(&state);
                        break;
                    }
                }
            })
        };

        Self {
            id: u64::from_be_bytes(crypto::random_array::<8>()),
            state,
            keys,
            writer,
            inbound: Arc::new(tokio::sync::Mutex::new(rx)),
            last_activity,
            tasks: Arc::new(Mutex::new(vec![reader, keepalive])),
        }
    }

    pub fn session_id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// True iff the session is Ready for traffic.
    pub fn is_connected(&self) -> bool {
        self.state().is_ready()
    }

    /// Seals `payload` under the send key and transmits one frame.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }
        let frame = crypto::seal(&self.keys.send, payload)?;
        let mut w = self.writer.lock().await;
        if let Err(e) = w.send_frame(frame).await {
            drop(w);
            force_closed(&self.state);
            return Err(e);
        }
        self.touch();
        Ok(())
    }

    /// Waits for the next inbound frame and opens it.
    ///
    /// `Ok(None)` means the transport reached EOF. An unopenable frame is
    /// fatal: the session is closed and [`SessionError::Crypto`] surfaces.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, SessionError> {
        let frame = {
            let mut rx = self.inbound.lock().await;
            rx.recv().await
        };
        match frame {
            Some(frame) => {
                self.touch();
                match crypto::open(&self.keys.recv, &frame) {
                    Ok(plaintext) => Ok(Some(plaintext)),
                    Err(e) => {
                        force_closed(&self.state);
                        Err(e.into())
                    }
                }
            }
            None => Ok(None),
        }
    }

    /// [`recv`](Self::recv) with a deadline, for request/response exchanges.
    pub async fn recv_timeout(&self, deadline: Duration) -> Result<Option<Vec<u8>>, SessionError> {
        timeout(deadline, self.recv())
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    /// [`recv`](Self::recv) under the standard 30 s exchange deadline.
    pub async fn recv_response(&self) -> Result<Option<Vec<u8>>, SessionError> {
        self.recv_timeout(RECV_DEADLINE).await
    }

    /// Asks the relay to open a TCP connection to `host:port`.
    ///
    /// Payload is a 2-byte big-endian length followed by the ASCII target.
    /// The relay answers with a single byte: `0x00` on success, anything else
    /// is the refusal code.
    pub async fn send_connect(&self, host: &str, port: u16) -> Result<(), SessionError> {
        let target = format!("{host}:{port}");
        let mut payload = Vec::with_capacity(2 + target.len());
        payload.extend_from_slice(&(target.len() as u16).to_be_bytes());
        payload.extend_from_slice(target.as_bytes());
        self.send(&payload).await?;

        let reply = self
            .recv_timeout(CONNECT_REPLY_DEADLINE)
            .await?
            .ok_or(SessionError::Closed)?;
        match reply.first() {
            Some(0x00) => Ok(()),
            Some(&code) => Err(SessionError::Connect(code)),
            None => Err(SessionError::Protocol("empty connect reply".into())),
        }
    }

    /// How long the session has gone without traffic in either direction.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Closes the session: terminal state, background tasks aborted, a
    /// best-effort Close frame sent.
    pub fn close(&self) {
        {
            let mut st = self.state.lock();
            if *st == SessionState::Closed {
                return;
            }
            *st = SessionState::Closed;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let writer = self.writer.clone();
        tokio::spawn(async move {
            let mut w = writer.lock().await;
            let _ = w.send_close().await;
        });
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Forces the state to Closed. Closing is legal from every state, so direct
/// assignment preserves the machine's invariants.
fn force_closed(state: &Mutex<SessionState>) {
    let mut st = state.lock();
    if *st != SessionState::Closed {
        *st = SessionState::Closed;
    }
}
