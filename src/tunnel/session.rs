//! Secure tunnel session
//!
//! [`SecureConnector`] / [`SecureSession`] are the seam between the resilience
//! manager and the transport. The russh-backed implementation lives here too:
//! connect + authenticate through [`SshClient`], then install the forwards
//! through the session's [`HandleController`].

use async_trait::async_trait;
use tracing::{debug, info};

use super::error::TunnelError;
use crate::config::AgentConfig;
use crate::forwarding::{
    start_local_forward, start_remote_forward, LocalForward, LocalForwardHandle, RemoteForward,
    RemoteForwardHandle, RemoteForwardTable,
};
use crate::ssh::{spawn_handle_owner_task, HandleController, PingResult, SshClient, SshConfig};

/// A port forward the tunnel installs on every (re)connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardSpec {
    /// Server binds `bind_host:bind_port` and relays to `target_host:target_port` here
    RemoteBind {
        bind_host: String,
        bind_port: u16,
        target_host: String,
        target_port: u16,
    },
    /// We bind `bind_addr` and relay to `remote_host:remote_port` over there
    LocalBind {
        bind_addr: String,
        remote_host: String,
        remote_port: u16,
    },
}

impl ForwardSpec {
    /// The two forwards of a grid tunnel: grid -> local relay proxy, and
    /// local hub port -> grid hub
    pub fn for_agent(config: &AgentConfig) -> Vec<ForwardSpec> {
        vec![
            ForwardSpec::RemoteBind {
                bind_host: "localhost".into(),
                bind_port: config.remote_proxy_port,
                target_host: "127.0.0.1".into(),
                target_port: config.proxy_port,
            },
            ForwardSpec::LocalBind {
                bind_addr: format!("127.0.0.1:{}", config.se_port),
                remote_host: "localhost".into(),
                remote_port: config.hub_port,
            },
        ]
    }
}

/// A forward as installed, with the port that was actually bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveForward {
    pub spec: ForwardSpec,
    pub bound_port: u16,
}

/// Opens authenticated secure sessions
#[async_trait]
pub trait SecureConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SecureSession>, TunnelError>;
}

/// One connected secure session
#[async_trait]
pub trait SecureSession: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Transport still up
    fn is_connected(&self) -> bool;

    /// Install a forward; returns the bound port
    async fn install_forward(&mut self, spec: &ForwardSpec) -> Result<u16, TunnelError>;

    /// Keepalive round trip
    async fn ping(&self) -> PingResult;

    /// Remove forwards and close the transport; safe to call twice
    async fn disconnect(&mut self);
}

/// The secure session as owned by the resilience manager
pub struct TunnelSession {
    pub id: String,
    session: Box<dyn SecureSession>,
    pub authenticated: bool,
    pub forwards: Vec<ActiveForward>,
}

impl TunnelSession {
    pub fn new(session: Box<dyn SecureSession>) -> Self {
        let authenticated = session.is_authenticated();
        Self {
            id: short_id(),
            session,
            authenticated,
            forwards: Vec::new(),
        }
    }

    /// Install every forward, in order; the first failure aborts
    pub async fn install_forwards(&mut self, specs: &[ForwardSpec]) -> Result<(), TunnelError> {
        for spec in specs {
            let bound_port = self.session.install_forward(spec).await?;
            debug!("Session {} installed {:?} on port {}", self.id, spec, bound_port);
            self.forwards.push(ActiveForward {
                spec: spec.clone(),
                bound_port,
            });
        }
        Ok(())
    }

    /// Bound port of the first local-bind forward
    pub fn local_port(&self) -> Option<u16> {
        self.forwards
            .iter()
            .find(|f| matches!(f.spec, ForwardSpec::LocalBind { .. }))
            .map(|f| f.bound_port)
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub async fn ping(&self) -> PingResult {
        self.session.ping().await
    }

    pub async fn disconnect(&mut self) {
        self.session.disconnect().await;
        self.forwards.clear();
    }
}

/// 8 hex chars of a v4 uuid
fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Connects to a tunnel server over SSH
pub struct SshTunnelConnector {
    config: SshConfig,
}

impl SshTunnelConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SecureConnector for SshTunnelConnector {
    async fn connect(&self) -> Result<Box<dyn SecureSession>, TunnelError> {
        // Fresh table per connection: forwards of a dead session never match
        let table = RemoteForwardTable::new();
        let handle = SshClient::new(self.config.clone(), table.clone())
            .connect()
            .await?;
        let session_id = format!("{}@{}", self.config.username, self.config.host);
        let controller = spawn_handle_owner_task(handle, session_id);

        Ok(Box::new(SshTunnelSession {
            controller,
            table,
            local: Vec::new(),
            remote: Vec::new(),
        }))
    }
}

/// russh session with its forwards
pub struct SshTunnelSession {
    controller: HandleController,
    table: RemoteForwardTable,
    local: Vec<LocalForwardHandle>,
    remote: Vec<RemoteForwardHandle>,
}

#[async_trait]
impl SecureSession for SshTunnelSession {
    fn is_authenticated(&self) -> bool {
        // SshClient::connect only returns authenticated handles
        true
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    async fn install_forward(&mut self, spec: &ForwardSpec) -> Result<u16, TunnelError> {
        match spec {
            ForwardSpec::RemoteBind {
                bind_host,
                bind_port,
                target_host,
                target_port,
            } => {
                let handle = start_remote_forward(
                    self.controller.clone(),
                    RemoteForward::new(bind_host.clone(), *bind_port, target_host.clone(), *target_port),
                    self.table.clone(),
                )
                .await?;
                let port = handle.bound_port;
                self.remote.push(handle);
                Ok(port)
            }
            ForwardSpec::LocalBind {
                bind_addr,
                remote_host,
                remote_port,
            } => {
                let handle = start_local_forward(
                    self.controller.clone(),
                    LocalForward::new(bind_addr.clone(), remote_host.clone(), *remote_port),
                )
                .await?;
                let port = handle.bound_addr.port();
                self.local.push(handle);
                Ok(port)
            }
        }
    }

    async fn ping(&self) -> PingResult {
        self.controller.ping().await
    }

    async fn disconnect(&mut self) {
        for handle in self.remote.drain(..) {
            handle.stop().await;
        }
        for handle in self.local.drain(..) {
            handle.stop().await;
        }
        if self.controller.is_connected() {
            info!("Closing SSH session");
            self.controller.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct StubSession {
        up: Arc<AtomicBool>,
        next_port: u16,
        fail_forwards: bool,
    }

    #[async_trait]
    impl SecureSession for StubSession {
        fn is_authenticated(&self) -> bool {
            true
        }
        fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        async fn install_forward(&mut self, _spec: &ForwardSpec) -> Result<u16, TunnelError> {
            if self.fail_forwards {
                return Err(TunnelError::Forward("bind refused".into()));
            }
            self.next_port += 1;
            Ok(self.next_port)
        }
        async fn ping(&self) -> PingResult {
            PingResult::Ok
        }
        async fn disconnect(&mut self) {
            self.up.store(false, Ordering::SeqCst);
        }
    }

    fn agent_config() -> AgentConfig {
        AgentConfig {
            api_key: "k".into(),
            api_secret: "s".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_agent_forwards() {
        let specs = ForwardSpec::for_agent(&agent_config());
        assert_eq!(
            specs[0],
            ForwardSpec::RemoteBind {
                bind_host: "localhost".into(),
                bind_port: 2010,
                target_host: "127.0.0.1".into(),
                target_port: 8087,
            }
        );
        assert_eq!(
            specs[1],
            ForwardSpec::LocalBind {
                bind_addr: "127.0.0.1:4445".into(),
                remote_host: "localhost".into(),
                remote_port: 80,
            }
        );
    }

    #[tokio::test]
    async fn test_session_tracks_forwards() {
        let up = Arc::new(AtomicBool::new(true));
        let mut session = TunnelSession::new(Box::new(StubSession {
            up: up.clone(),
            next_port: 5000,
            fail_forwards: false,
        }));
        assert_eq!(session.id.len(), 8);
        assert!(session.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(session.authenticated);

        session
            .install_forwards(&ForwardSpec::for_agent(&agent_config()))
            .await
            .unwrap();
        assert_eq!(session.forwards.len(), 2);
        assert_eq!(session.local_port(), Some(5002));

        session.disconnect().await;
        assert!(session.forwards.is_empty());
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_forward_failure_surfaces() {
        let mut session = TunnelSession::new(Box::new(StubSession {
            up: Arc::new(AtomicBool::new(true)),
            next_port: 0,
            fail_forwards: true,
        }));
        let result = session
            .install_forwards(&ForwardSpec::for_agent(&agent_config()))
            .await;
        assert!(matches!(result, Err(TunnelError::Forward(_))));
        assert_eq!(session.local_port(), None);
    }
}
