//! Immutable proxy configuration.
//!
//! The core never reads configuration from disk; the host application hands a
//! validated [`ProxyConfig`] to the supervisor at start. Every field is checked
//! here so the rest of the crate can assume validity.

use thiserror::Error;

/// Length of the pre-shared key in raw bytes.
pub const PSK_LEN: usize = 32;

/// Errors produced while validating a [`ProxyConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sni host must not be empty")]
    EmptySniHost,
    #[error("relay address must not be empty")]
    EmptyRelayAddress,
    #[error("relay port must be in 1..=65535")]
    PortOutOfRange,
    #[error("websocket path must begin with '/'")]
    MalformedPath,
    #[error("pre-shared key must be exactly 64 hex characters")]
    InvalidPskLength,
    #[error("pre-shared key is not valid hex: {0}")]
    InvalidPskEncoding(String),
}

/// Validated, immutable input to the proxy core.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host name presented as SNI in the TLS handshake and as the HTTP
    /// `Host` header during the WebSocket upgrade.
    pub sni_host: String,
    /// IPv4 address or domain the TCP+TLS connection is opened against.
    pub relay_addr: String,
    pub relay_port: u16,
    /// WebSocket upgrade path, always starting with `/`.
    pub ws_path: String,
    /// 32-byte pre-shared key agreed out of band with the relay.
    pub psk: [u8; PSK_LEN],
    /// When false (the default), the relay certificate is accepted without
    /// verification; endpoint authentication comes from the PSK handshake.
    pub verify_tls: bool,
}

impl ProxyConfig {
    /// Builds a config from raw inputs, rejecting anything the core cannot
    /// safely assume later.
    pub fn new(
        sni_host: impl Into<String>,
        relay_addr: impl Into<String>,
        relay_port: u16,
        ws_path: impl Into<String>,
        psk_hex: &str,
    ) -> Result<Self, ConfigError> {
        let sni_host = sni_host.into();
        if sni_host.is_empty() {
            return Err(ConfigError::EmptySniHost);
        }
        let relay_addr = relay_addr.into();
        if relay_addr.is_empty() {
            return Err(ConfigError::EmptyRelayAddress);
        }
        if relay_port == 0 {
            return Err(ConfigError::PortOutOfRange);
        }
        let ws_path = ws_path.into();
        if !ws_path.starts_with('/') {
            return Err(ConfigError::MalformedPath);
        }
        let psk = parse_psk(psk_hex)?;
        Ok(Self {
            sni_host,
            relay_addr,
            relay_port,
            ws_path,
            psk,
            verify_tls: false,
        })
    }

    /// Enables real certificate verification against the webpki root store.
    pub fn with_tls_verification(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Relay URL used for the WebSocket upgrade request.
    pub fn relay_url(&self) -> String {
        format!(
            "wss://{}:{}{}",
            self.relay_addr, self.relay_port, self.ws_path
        )
    }
}

/// Parses a 64-hex-character pre-shared key into its 32 raw bytes.
pub fn parse_psk(psk_hex: &str) -> Result<[u8; PSK_LEN], ConfigError> {
    if psk_hex.len() != PSK_LEN * 2 {
        return Err(ConfigError::InvalidPskLength);
    }
    let bytes =
        hex::decode(psk_hex).map_err(|e| ConfigError::InvalidPskEncoding(e.to_string()))?;
    let mut psk = [0u8; PSK_LEN];
    psk.copy_from_slice(&bytes);
    Ok(psk)
}
