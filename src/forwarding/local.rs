//! Local Port Forwarding
//!
//! Local port -> direct-tcpip channel -> host:port on the far side.
//! The tunnel uses it to expose the grid hub locally, e.g.
//! `127.0.0.1:4445 -> localhost:80`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::bridge::{bridge_channel, FORWARD_IDLE_TIMEOUT};
use super::{wait_for_drain, ForwardCounters, ForwardStats};
use crate::ssh::{HandleController, SshError};

/// Local port forwarding configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1:4445")
    pub local_addr: String,
    /// Host to reach on the far side of the tunnel
    pub remote_host: String,
    pub remote_port: u16,
}

impl LocalForward {
    pub fn new(
        local_addr: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            local_addr: local_addr.into(),
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Handle to a running local port forward
pub struct LocalForwardHandle {
    pub config: LocalForward,
    /// Actual bound address (may differ from requested if port was 0)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    counters: Arc<ForwardCounters>,
}

impl LocalForwardHandle {
    /// Stop accepting and wait briefly for active connections to close
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping local port forward on {}", self.bound_addr);
        let _ = self.stop_tx.send(()).await;
        wait_for_drain(
            &self.counters,
            Duration::from_secs(5),
            &self.bound_addr.to_string(),
        )
        .await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }
}

/// Start local port forwarding
///
/// Spawns the accept loop; each client gets its own direct-tcpip channel.
/// The loop ends on `stop()` or when the SSH connection drops.
pub async fn start_local_forward(
    handle_controller: HandleController,
    config: LocalForward,
) -> Result<LocalForwardHandle, SshError> {
    let mut disconnect_rx = handle_controller.subscribe_disconnect();

    let listener = TcpListener::bind(&config.local_addr)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => SshError::ForwardError(format!(
                "Port already in use: {}. Another application may be using this port.",
                config.local_addr
            )),
            std::io::ErrorKind::PermissionDenied => SshError::ForwardError(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                config.local_addr
            )),
            std::io::ErrorKind::AddrNotAvailable => SshError::ForwardError(format!(
                "Address not available: {}. The specified address is not valid on this system.",
                config.local_addr
            )),
            _ => SshError::ForwardError(format!("Failed to bind to {}: {}", config.local_addr, e)),
        })?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::ForwardError(format!("Failed to get bound address: {}", e)))?;

    info!(
        "Started local port forward: {} -> {}:{}",
        bound_addr, config.remote_host, config.remote_port
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let counters = Arc::new(ForwardCounters::new());
    let counters_clone = counters.clone();

    let remote_host = config.remote_host.clone();
    let remote_port = config.remote_port;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = disconnect_rx.recv() => {
                    info!("Local port forward stopped: SSH disconnected");
                    break;
                }

                _ = stop_rx.recv() => {
                    info!("Local port forward stopped by request");
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_clone.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("Accepted connection from {} for forward", peer_addr);

                            counters_clone.opened();
                            let controller = handle_controller.clone();
                            let remote_host = remote_host.clone();
                            let counters = counters_clone.clone();

                            tokio::spawn(async move {
                                let result = handle_forward_connection(
                                    &controller,
                                    stream,
                                    &remote_host,
                                    remote_port,
                                    &counters,
                                )
                                .await;
                                counters.closed();
                                if let Err(e) = result {
                                    warn!("Forward connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_clone.store(false, Ordering::SeqCst);
        info!("Local port forward task exited");
    });

    Ok(LocalForwardHandle {
        config,
        bound_addr,
        running,
        stop_tx,
        counters,
    })
}

async fn handle_forward_connection(
    handle_controller: &HandleController,
    local_stream: TcpStream,
    remote_host: &str,
    remote_port: u16,
    counters: &ForwardCounters,
) -> Result<(), SshError> {
    let channel = handle_controller
        .open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
        .await?;

    debug!("Opened channel for forward to {}:{}", remote_host, remote_port);

    bridge_channel(local_stream, channel, counters, FORWARD_IDLE_TIMEOUT).await;

    debug!("Forward connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::HandleCommand;
    use tokio::io::AsyncReadExt;

    /// Owner stand-in that refuses every channel
    fn refusing_controller() -> HandleController {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                if let HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } = cmd {
                    let _ = reply_tx.send(Err(russh::Error::Disconnect));
                }
            }
        });
        HandleController::new(cmd_tx)
    }

    #[tokio::test]
    async fn test_refused_channel_closes_client() {
        let handle = start_local_forward(
            refusing_controller(),
            LocalForward::new("127.0.0.1:0", "localhost", 80),
        )
        .await
        .unwrap();
        assert!(handle.is_running());

        let mut client = TcpStream::connect(handle.bound_addr).await.unwrap();
        let mut buf = Vec::new();
        assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = handle.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.active_connections, 0);

        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let result = start_local_forward(
            refusing_controller(),
            LocalForward::new(addr.to_string(), "localhost", 80),
        )
        .await;
        match result {
            Err(SshError::ForwardError(msg)) => assert!(msg.contains("already in use")),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("bind should have failed"),
        }
    }

    #[tokio::test]
    async fn test_ssh_disconnect_stops_forward() {
        let controller = refusing_controller();
        let handle = start_local_forward(
            controller.clone(),
            LocalForward::new("127.0.0.1:0", "localhost", 80),
        )
        .await
        .unwrap();

        controller.notify_disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_running());
    }
}
