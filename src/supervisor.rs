//! Lifecycle supervisor: the single top-level owner of the proxy core.
//!
//! There are no process-wide singletons; the host constructs one
//! [`Supervisor`] and drives it. Starting builds the pool, takes the TUN
//! endpoint from the host, and spawns the engine; stopping cancels the
//! engine, drains flows, cleans up the pool, and drops the TUN handle.
//! External observers follow the lifecycle through a watch channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ProxyConfig;
use crate::engine::{EngineConfig, PacketEngine, TunInterface};
use crate::pool::SessionPool;
use crate::session::{TransportConnector, WsConnector};

const STOP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("proxy is already running")]
    AlreadyRunning,
}

struct Active {
    cancel: CancellationToken,
    engine: PacketEngine,
    pool: Arc<SessionPool>,
    run_task: JoinHandle<()>,
}

/// Owns the pool and the engine and sequences their lifecycles.
pub struct Supervisor {
    status: watch::Sender<LifecycleState>,
    inner: Mutex<Option<Active>>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LifecycleState::Idle);
        Self {
            status,
            inner: Mutex::new(None),
        }
    }

    /// Read-only view of the lifecycle; observers `changed().await` on it.
    pub fn status(&self) -> watch::Receiver<LifecycleState> {
        self.status.subscribe()
    }

    pub fn state(&self) -> LifecycleState {
        *self.status.borrow()
    }

    /// Brings the proxy up against the real relay transport.
    pub async fn start(
        &self,
        config: ProxyConfig,
        tun: Arc<dyn TunInterface>,
    ) -> Result<(), SupervisorError> {
        let psk = config.psk;
        let connector = Arc::new(WsConnector::new(config));
        self.start_with_connector(connector, psk, tun, EngineConfig::default())
            .await
    }

    /// Brings the proxy up with an explicit connector and engine settings.
    pub async fn start_with_connector(
        &self,
        connector: Arc<dyn TransportConnector>,
        psk: [u8; 32],
        tun: Arc<dyn TunInterface>,
        engine_config: EngineConfig,
    ) -> Result<(), SupervisorError> {
        if self.inner.lock().is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.status.send_replace(LifecycleState::Starting);
        info!(target: "sproxy::supervisor", "starting");

        let pool = Arc::new(SessionPool::new(connector, psk));
        pool.initialise().await;

        let cancel = CancellationToken::new();
        let engine = PacketEngine::new(tun, pool.clone(), engine_config, cancel.child_token());
        let run_task = tokio::spawn({
            let engine = engine.clone();
            let status = self.status.clone();
            async move {
                if let Err(e) = engine.run().await {
                    error!(target: "sproxy::supervisor", error = %e, "engine failed");
                    status.send_if_modified(|state| {
                        if matches!(state, LifecycleState::Starting | LifecycleState::Running) {
                            *state = LifecycleState::Error;
                            true
                        } else {
                            false
                        }
                    });
                }
            }
        });

        *self.inner.lock() = Some(Active {
            cancel,
            engine,
            pool,
            run_task,
        });
        self.status.send_replace(LifecycleState::Running);
        info!(target: "sproxy::supervisor", "running");
        Ok(())
    }

    /// Tears everything down in reverse order: engine, flows, pool, TUN.
    ///
    /// Idempotent; a second call is a no-op.
    pub async fn stop(&self) {
        let Some(active) = self.inner.lock().take() else {
            return;
        };
        self.status.send_replace(LifecycleState::Stopping);
        info!(target: "sproxy::supervisor", "stopping");

        active.cancel.cancel();
        if timeout(STOP_DEADLINE, active.run_task).await.is_err() {
            error!(target: "sproxy::supervisor", "engine did not stop in time");
        }
        // The engine drains on exit; repeat here in case it was stuck.
        active.engine.drain_flows();
        active.pool.cleanup();
        // The engine and pool are dropped here, releasing the last engine
        // reference and with it the TUN handle.

        self.status.send_replace(LifecycleState::Stopped);
        info!(target: "sproxy::supervisor", "stopped");
    }

    /// Host signal that the VPN permission was revoked. Observed as an
    /// immediate stop.
    pub async fn on_permission_revoked(&self) {
        info!(target: "sproxy::supervisor", "permission revoked");
        self.stop().await;
    }
}
