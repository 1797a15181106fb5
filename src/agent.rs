//! Agent orchestrator
//!
//! Drives the whole lifecycle: request a tunnel from the control plane, wait
//! for it, run a [`TunnelManager`] against it, and when the manager gives up
//! tear everything down and request a brand-new tunnel.
//!
//! The proxy listener lives across rebuilds. While no tunnel is live its
//! [`RelayGate`] is closed, so clients queue in the accept backlog.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::relay::{
    start_proxy_listener, HttpDelegate, RelayError, RelayGate, RelayMetrics, RelayReactor,
};
use crate::ssh::SshConfig;
use crate::tunnel::{
    ManagerSettings, SecureConnector, SshTunnelConnector, TunnelError, TunnelEvent, TunnelManager,
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const READY_TIMEOUT: Duration = Duration::from_secs(120);
const REBUILD_DELAY: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Tunnel {id} not ready after {waited:?}")]
    NotReady { id: String, waited: Duration },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl AgentError {
    /// Rebuilding cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Tunnel(e) if e.is_auth()) || matches!(self, AgentError::Relay(_))
    }
}

/// A tunnel record as seen by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: String,
    /// SSH endpoint of the tunnel server
    pub host: String,
    pub username: String,
    pub ready: bool,
}

/// Creates, polls and destroys remote tunnel records
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn create_tunnel(&self) -> Result<TunnelInfo, AgentError>;
    async fn poll_tunnel(&self, id: &str) -> Result<TunnelInfo, AgentError>;
    async fn destroy_tunnel(&self, id: &str) -> Result<(), AgentError>;
}

/// Control plane for a fixed, always-ready tunnel server
#[derive(Debug, Clone)]
pub struct StaticControlPlane {
    host: String,
    username: String,
}

impl StaticControlPlane {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, AgentError> {
        let host = config
            .tunnel_host
            .clone()
            .ok_or_else(|| AgentError::ControlPlane("tunnel_host is not configured".into()))?;
        Ok(Self::new(host, config.api_key.clone()))
    }

    fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: format!("static-{}", self.host),
            host: self.host.clone(),
            username: self.username.clone(),
            ready: true,
        }
    }
}

#[async_trait]
impl ControlPlane for StaticControlPlane {
    async fn create_tunnel(&self) -> Result<TunnelInfo, AgentError> {
        Ok(self.info())
    }

    async fn poll_tunnel(&self, _id: &str) -> Result<TunnelInfo, AgentError> {
        Ok(self.info())
    }

    async fn destroy_tunnel(&self, _id: &str) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Builds the secure connector for a provisioned tunnel
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, tunnel: &TunnelInfo) -> Arc<dyn SecureConnector>;
}

/// russh connectors authenticating with the grid credentials
pub struct SshConnectorFactory {
    config: AgentConfig,
}

impl SshConnectorFactory {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

impl ConnectorFactory for SshConnectorFactory {
    fn connector(&self, tunnel: &TunnelInfo) -> Arc<dyn SecureConnector> {
        Arc::new(SshTunnelConnector::new(SshConfig::for_tunnel(
            tunnel.host.clone(),
            tunnel.username.clone(),
            &self.config,
        )))
    }
}

enum TunnelExit {
    GaveUp,
    Shutdown,
}

pub struct TunnelAgent {
    config: AgentConfig,
    control: Arc<dyn ControlPlane>,
    connectors: Arc<dyn ConnectorFactory>,
    delegate: Arc<dyn HttpDelegate>,
    reactor: RelayReactor,
    gate: RelayGate,
    shutdown: CancellationToken,
    rebuilds: AtomicU32,
}

impl TunnelAgent {
    pub fn new(
        config: AgentConfig,
        control: Arc<dyn ControlPlane>,
        connectors: Arc<dyn ConnectorFactory>,
        delegate: Arc<dyn HttpDelegate>,
    ) -> Self {
        let reactor = RelayReactor::from_config(&config, Arc::new(RelayMetrics::new()));
        Self {
            config,
            control,
            connectors,
            delegate,
            reactor,
            gate: RelayGate::new(false),
            shutdown: CancellationToken::new(),
            rebuilds: AtomicU32::new(0),
        }
    }

    pub fn reactor(&self) -> &RelayReactor {
        &self.reactor
    }

    pub fn gate(&self) -> &RelayGate {
        &self.gate
    }

    /// Tunnels torn down and requested again after a give-up
    pub fn rebuild_count(&self) -> u32 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    /// Ask `run()` to stop; it tears down the current tunnel before returning
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until `shutdown()` or a failure a rebuild cannot fix
    pub async fn run(&self) -> Result<(), AgentError> {
        let bind_addr = format!("127.0.0.1:{}", self.config.proxy_port);
        let listener = start_proxy_listener(
            &bind_addr,
            self.reactor.clone(),
            self.delegate.clone(),
            self.gate.clone(),
        )
        .await?;

        let result = loop {
            match self.run_tunnel().await {
                Ok(TunnelExit::Shutdown) => break Ok(()),
                Ok(TunnelExit::GaveUp) => {
                    let n = self.rebuilds.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Requesting a new tunnel (rebuild #{})", n);
                }
                Err(e) if e.is_fatal() => {
                    error!("Tunnel agent cannot continue: {}", e);
                    break Err(e);
                }
                Err(e) => warn!("Tunnel setup failed: {}", e),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                _ = sleep(REBUILD_DELAY) => {}
            }
        };

        listener.stop().await;
        self.reactor.shutdown();
        info!("Tunnel agent stopped");
        result
    }

    /// One tunnel from creation to give-up or shutdown
    async fn run_tunnel(&self) -> Result<TunnelExit, AgentError> {
        let Some(tunnel) = self.provision().await? else {
            return Ok(TunnelExit::Shutdown);
        };

        let gave_up = Arc::new(Notify::new());
        let notify = gave_up.clone();
        let manager = TunnelManager::new(
            self.connectors.connector(&tunnel),
            ManagerSettings::from_config(&self.config),
            self.gate.clone(),
        )
        .with_rebuild_hook(move || notify.notify_one());
        let mut events = manager.subscribe();

        if let Err(e) = manager.start().await {
            self.teardown(&tunnel, &manager).await;
            return Err(e.into());
        }
        info!("Tunnel {} is up via {}", tunnel.id, tunnel.host);

        let exit = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break TunnelExit::Shutdown,
                _ = gave_up.notified() => break TunnelExit::GaveUp,
                event = events.recv() => match event {
                    Ok(event) => log_event(&tunnel.id, &event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Skipped {} tunnel events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break TunnelExit::GaveUp,
                },
            }
        };

        self.teardown(&tunnel, &manager).await;
        Ok(exit)
    }

    /// Create a tunnel and wait until it is ready; `None` on shutdown
    async fn provision(&self) -> Result<Option<TunnelInfo>, AgentError> {
        let mut tunnel = self.control.create_tunnel().await?;
        info!("Created tunnel {}", tunnel.id);

        let started = Instant::now();
        while !tunnel.ready {
            if started.elapsed() >= READY_TIMEOUT {
                self.destroy(&tunnel.id).await;
                return Err(AgentError::NotReady {
                    id: tunnel.id,
                    waited: READY_TIMEOUT,
                });
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.destroy(&tunnel.id).await;
                    return Ok(None);
                }
                _ = sleep(POLL_INTERVAL) => {}
            }
            tunnel = self.control.poll_tunnel(&tunnel.id).await?;
            debug!("Tunnel {} ready: {}", tunnel.id, tunnel.ready);
        }
        Ok(Some(tunnel))
    }

    async fn teardown(&self, tunnel: &TunnelInfo, manager: &TunnelManager) {
        manager.stop().await;
        self.gate.pause();
        self.reactor.cancel_all();
        self.destroy(&tunnel.id).await;
    }

    async fn destroy(&self, id: &str) {
        match self.control.destroy_tunnel(id).await {
            Ok(()) => info!("Destroyed tunnel {}", id),
            Err(e) => error!("Failed to destroy tunnel {}: {}", id, e),
        }
    }
}

fn log_event(tunnel_id: &str, event: &TunnelEvent) {
    match event {
        TunnelEvent::Connected { session_id } => {
            info!(tunnel_id, session_id = %session_id, "Tunnel session connected")
        }
        TunnelEvent::Lost { session_id } => {
            warn!(tunnel_id, session_id = %session_id, "Tunnel session lost")
        }
        TunnelEvent::Retrying {
            attempt,
            max_attempts,
        } => warn!(tunnel_id, "Reconnect attempt {}/{} failed", attempt, max_attempts),
        TunnelEvent::Recovered {
            session_id,
            attempts,
        } => info!(
            tunnel_id,
            session_id = %session_id,
            "Tunnel recovered after {} attempt(s)", attempts
        ),
        TunnelEvent::GaveUp { reason } => error!(tunnel_id, "Tunnel gave up: {}", reason),
        TunnelEvent::Stopped => debug!(tunnel_id, "Tunnel manager stopped"),
    }
}
