//! Relay transport: TLS + WebSocket carrying binary frames.
//!
//! The session logic only ever sees the [`FrameSink`]/[`FrameSource`] pair, so
//! tests can substitute in-memory channels for the real network. The real
//! implementation dials TCP to the relay address, wraps it in TLS with the
//! configured SNI, performs the HTTP upgrade, and exposes the split halves of
//! the WebSocket stream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::config::ProxyConfig;

use super::SessionError;

/// TCP connect plus upgrade deadline; the handshake deadline above this is
/// enforced by the session.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Frames never exceed MTU + AEAD overhead; anything near this cap is a
/// misbehaving relay.
const MAX_FRAME: usize = 1 << 20;

/// Write half of a relay transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Transmits one binary frame.
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SessionError>;
    /// Transmits a transport-level keepalive ping.
    async fn send_ping(&mut self) -> Result<(), SessionError>;
    /// Initiates a clean transport close.
    async fn send_close(&mut self) -> Result<(), SessionError>;
}

/// Read half of a relay transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound binary frame; `Ok(None)` means the transport reached EOF.
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError>;
}

/// Anything that can produce a fresh, upgraded relay transport.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), SessionError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), SessionError> {
        self.inner
            .send(Message::Binary(frame.into()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), SessionError> {
        self.inner
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn send_close(&mut self) -> Result<(), SessionError> {
        self.inner
            .send(Message::Close(None))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        loop {
            match self.inner.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(SessionError::Transport(e.to_string())),
                Some(Ok(Message::Binary(frame))) => return Ok(Some(frame.to_vec())),
                Some(Ok(Message::Close(_))) => return Ok(None),
                // Control frames and stray text are not protocol traffic.
                Some(Ok(_)) => continue,
            }
        }
    }
}

/// Production connector: TCP to the relay address, TLS with the SNI host,
/// WebSocket upgrade with the protocol headers.
pub struct WsConnector {
    config: ProxyConfig,
    tls: Arc<rustls::ClientConfig>,
}

impl WsConnector {
    pub fn new(config: ProxyConfig) -> Self {
        let tls = Arc::new(build_tls_config(config.verify_tls));
        Self { config, tls }
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn connect(&self) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), SessionError> {
        // The request URI carries the SNI host so both the TLS server name
        // and the Host header show it; the TCP connection itself goes to the
        // relay address.
        let authority = if self.config.relay_port == 443 {
            self.config.sni_host.clone()
        } else {
            format!("{}:{}", self.config.sni_host, self.config.relay_port)
        };
        let url = format!("wss://{}{}", authority, self.config.ws_path);
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "user-agent",
            HeaderValue::from_static("SecureProxy-Android/1.0"),
        );
        headers.insert("x-protocol-version", HeaderValue::from_static("1"));

        let addr = (self.config.relay_addr.as_str(), self.config.relay_port);
        let tcp = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Transport("tcp connect timeout".into()))?
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        let connector = Connector::Rustls(self.tls.clone());
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(MAX_FRAME))
            .max_frame_size(Some(MAX_FRAME));
        let (ws, response) = timeout(
            DIAL_TIMEOUT,
            client_async_tls_with_config(request, tcp, Some(ws_config), Some(connector)),
        )
        .await
        .map_err(|_| SessionError::Transport("websocket upgrade timeout".into()))?
        .map_err(|e| SessionError::Transport(e.to_string()))?;
        debug!(
            target: "sproxy::session",
            status = response.status().as_u16(),
            relay = %self.config.relay_addr,
            "websocket upgrade complete"
        );

        let (sink, source) = ws.split();
        Ok((
            Box::new(WsSink { inner: sink }),
            Box::new(WsSource { inner: source }),
        ))
    }
}

/// Builds the client TLS configuration.
///
/// With `verify` false the relay certificate is accepted as-is; endpoint
/// authentication comes from the PSK handshake that follows. With `verify`
/// true the webpki root store applies and the SNI host must match.
fn build_tls_config(verify: bool) -> rustls::ClientConfig {
    if verify {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth()
    }
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_config_builds_in_both_modes() {
        let _ = build_tls_config(false);
        let _ = build_tls_config(true);
    }
}
