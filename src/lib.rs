//! Secure proxy core (v1.0).
//!
//! Tunnels device IP traffic read from a TUN interface through encrypted
//! WebSocket sessions to a relay. The handshake derives direction-specific
//! AES-256-GCM keys from a pre-shared secret via HKDF-SHA256; a bounded pool
//! amortises handshakes across flows; a userspace TCP engine terminates
//! device connections locally and a minimal DNS responder forwards UDP/53.

pub mod config;
pub mod crypto;
pub mod engine;
pub mod flow;
pub mod packet;
pub mod pool;
pub mod session;
pub mod sim;
pub mod supervisor;

pub use config::{ConfigError, ProxyConfig};
pub use engine::{DnsForwarder, EngineConfig, EngineError, PacketEngine, TunDevice, TunInterface};
pub use flow::{FlowError, FlowKey, FlowTable, TcpFlow, TcpFlowState};
pub use pool::SessionPool;
pub use session::{SecureSession, SessionError, SessionState, TransportConnector, WsConnector};
pub use supervisor::{LifecycleState, Supervisor, SupervisorError};
