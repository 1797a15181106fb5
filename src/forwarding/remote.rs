//! Remote Port Forwarding
//!
//! Server-side port -> forwarded-tcpip channel -> local host:port.
//! The tunnel uses it so the grid can reach the local relay proxy.
//!
//! ## Architecture
//!
//! 1. `start_remote_forward` sends `tcpip-forward` through the HandleController
//! 2. The bound port is registered in the session's [`RemoteForwardTable`]
//! 3. `ClientHandler` receives each forwarded-tcpip channel and looks its
//!    target up in the same table
//!
//! The table belongs to one SSH session; a reconnect starts with a fresh one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::bridge::{bridge_channel, FORWARD_IDLE_TIMEOUT};
use super::{wait_for_drain, ForwardCounters, ForwardStats};
use crate::ssh::{HandleController, SshError};

/// Remote port forwarding configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteForward {
    /// Bind address on the server (e.g., "localhost")
    pub remote_addr: String,
    /// Port to bind on the server
    pub remote_port: u16,
    /// Local host to connect to
    pub local_host: String,
    /// Local port to connect to
    pub local_port: u16,
}

impl RemoteForward {
    pub fn new(
        remote_addr: impl Into<String>,
        remote_port: u16,
        local_host: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            remote_port,
            local_host: local_host.into(),
            local_port,
        }
    }
}

/// Where a forwarded-tcpip channel should be bridged to
#[derive(Debug, Clone)]
pub struct RemoteForwardTarget {
    pub local_host: String,
    pub local_port: u16,
    pub counters: Arc<ForwardCounters>,
}

/// Per-session map `(bind address, bound port) -> local target`
#[derive(Debug, Clone, Default)]
pub struct RemoteForwardTable {
    forwards: Arc<RwLock<HashMap<(String, u16), RemoteForwardTarget>>>,
}

impl RemoteForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        remote_addr: &str,
        remote_port: u16,
        local_host: &str,
        local_port: u16,
    ) -> Arc<ForwardCounters> {
        let counters = Arc::new(ForwardCounters::new());
        self.forwards.write().insert(
            (remote_addr.to_string(), remote_port),
            RemoteForwardTarget {
                local_host: local_host.to_string(),
                local_port,
                counters: counters.clone(),
            },
        );
        debug!(
            "Registered remote forward: {}:{} -> {}:{}",
            remote_addr, remote_port, local_host, local_port
        );
        counters
    }

    pub fn unregister(&self, remote_addr: &str, remote_port: u16) {
        if self
            .forwards
            .write()
            .remove(&(remote_addr.to_string(), remote_port))
            .is_some()
        {
            debug!("Unregistered remote forward: {}:{}", remote_addr, remote_port);
        }
    }

    /// Exact match first; servers may report the bind address differently
    /// than it was requested, so a unique port match is accepted too
    pub fn lookup(&self, remote_addr: &str, remote_port: u16) -> Option<RemoteForwardTarget> {
        let forwards = self.forwards.read();
        if let Some(target) = forwards.get(&(remote_addr.to_string(), remote_port)) {
            return Some(target.clone());
        }
        let mut by_port = forwards
            .iter()
            .filter(|((_, port), _)| *port == remote_port)
            .map(|(_, target)| target);
        match (by_port.next(), by_port.next()) {
            (Some(target), None) => Some(target.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.forwards.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwards.read().is_empty()
    }
}

/// Handle to a running remote port forward
pub struct RemoteForwardHandle {
    pub config: RemoteForward,
    /// Actual bound port on the server (may differ if original was 0)
    pub bound_port: u16,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    handle_controller: HandleController,
    table: RemoteForwardTable,
    counters: Arc<ForwardCounters>,
}

impl RemoteForwardHandle {
    /// Cancel on the server, unregister, and wait briefly for active connections
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(
            "Stopping remote port forward {}:{}",
            self.config.remote_addr, self.bound_port
        );

        if let Err(e) = self
            .handle_controller
            .cancel_tcpip_forward(&self.config.remote_addr, self.bound_port as u32)
            .await
        {
            debug!("Failed to cancel remote forward: {}", e);
        }

        self.table
            .unregister(&self.config.remote_addr, self.bound_port);
        let _ = self.stop_tx.send(()).await;

        let label = format!("{}:{}", self.config.remote_addr, self.bound_port);
        wait_for_drain(&self.counters, Duration::from_secs(5), &label).await;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.counters.snapshot()
    }
}

/// Start remote port forwarding
///
/// Bridging happens in the `ClientHandler` callback when the server opens a
/// forwarded-tcpip channel for the bound port.
pub async fn start_remote_forward(
    handle_controller: HandleController,
    config: RemoteForward,
    table: RemoteForwardTable,
) -> Result<RemoteForwardHandle, SshError> {
    info!(
        "Requesting remote port forward: {}:{} -> {}:{}",
        config.remote_addr, config.remote_port, config.local_host, config.local_port
    );

    let mut disconnect_rx = handle_controller.subscribe_disconnect();

    let actual_port = handle_controller
        .tcpip_forward(&config.remote_addr, config.remote_port as u32)
        .await?;
    let bound_port = u16::try_from(actual_port).map_err(|_| {
        SshError::ForwardError(format!("Server bound an invalid port {}", actual_port))
    })?;

    info!(
        "Remote forward established: {}:{} (requested {}) -> {}:{}",
        config.remote_addr, bound_port, config.remote_port, config.local_host, config.local_port
    );

    let counters = table.register(
        &config.remote_addr,
        bound_port,
        &config.local_host,
        config.local_port,
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let table_clone = table.clone();
    let remote_addr = config.remote_addr.clone();

    // Unregister once stopped or once the SSH connection is gone
    tokio::spawn(async move {
        tokio::select! {
            _ = stop_rx.recv() => {
                info!("Remote port forward stopped by request");
            }
            _ = disconnect_rx.recv() => {
                info!("Remote port forward stopped: SSH disconnected");
            }
        }
        running_clone.store(false, Ordering::SeqCst);
        table_clone.unregister(&remote_addr, bound_port);
    });

    Ok(RemoteForwardHandle {
        config,
        bound_port,
        running,
        stop_tx,
        handle_controller,
        table,
        counters,
    })
}

/// Bridge one forwarded-tcpip channel to its registered local target
pub async fn handle_forwarded_connection(
    table: &RemoteForwardTable,
    channel: russh::Channel<russh::client::Msg>,
    connected_address: &str,
    connected_port: u32,
    originator_address: &str,
    originator_port: u32,
) -> Result<(), SshError> {
    debug!(
        "Handling forwarded connection: {}:{} from {}:{}",
        connected_address, connected_port, originator_address, originator_port
    );

    let port = u16::try_from(connected_port).unwrap_or_default();
    let target = table.lookup(connected_address, port).ok_or_else(|| {
        SshError::ForwardError(format!(
            "No registered forward for {}:{}",
            connected_address, connected_port
        ))
    })?;

    target.counters.opened();
    let counters = target.counters.clone();

    let local_addr = format!("{}:{}", target.local_host, target.local_port);
    let local_stream = match TcpStream::connect(&local_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            counters.closed();
            let _ = channel.close().await;
            return Err(SshError::ForwardError(format!(
                "Failed to connect to {}: {}",
                local_addr, e
            )));
        }
    };

    if let Err(e) = local_stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    debug!(
        "Bridging forwarded connection {}:{} -> {}",
        connected_address, connected_port, local_addr
    );

    bridge_channel(local_stream, channel, &counters, FORWARD_IDLE_TIMEOUT).await;
    counters.closed();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::HandleCommand;

    #[test]
    fn test_table_lookup() {
        let table = RemoteForwardTable::new();
        table.register("localhost", 2010, "127.0.0.1", 8087);

        let target = table.lookup("localhost", 2010).unwrap();
        assert_eq!(target.local_port, 8087);

        // Address reported differently by the server
        assert!(table.lookup("127.0.0.1", 2010).is_some());
        assert!(table.lookup("localhost", 2011).is_none());

        table.unregister("localhost", 2010);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ambiguous_port_needs_exact_address() {
        let table = RemoteForwardTable::new();
        table.register("10.0.0.1", 2010, "127.0.0.1", 8087);
        table.register("10.0.0.2", 2010, "127.0.0.1", 9000);

        assert!(table.lookup("0.0.0.0", 2010).is_none());
        assert_eq!(table.lookup("10.0.0.2", 2010).unwrap().local_port, 9000);
    }

    #[test]
    fn test_tables_are_independent() {
        let first = RemoteForwardTable::new();
        let second = RemoteForwardTable::new();
        first.register("localhost", 2010, "127.0.0.1", 8087);
        assert!(second.lookup("localhost", 2010).is_none());
        assert_eq!(first.clone().len(), 1);
    }

    /// Owner stand-in that binds `bound` and accepts cancels
    fn forwarding_controller(bound: u32) -> (HandleController, mpsc::Receiver<u32>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandleCommand::TcpipForward { reply_tx, .. } => {
                        let _ = reply_tx.send(Ok(bound));
                    }
                    HandleCommand::CancelTcpipForward { port, reply_tx, .. } => {
                        let _ = cancel_tx.send(port).await;
                        let _ = reply_tx.send(Ok(()));
                    }
                    _ => {}
                }
            }
        });
        (HandleController::new(cmd_tx), cancel_rx)
    }

    #[tokio::test]
    async fn test_start_registers_bound_port_and_stop_cancels() {
        let (controller, mut cancels) = forwarding_controller(41000);
        let table = RemoteForwardTable::new();

        let handle = start_remote_forward(
            controller,
            RemoteForward::new("localhost", 0, "127.0.0.1", 8087),
            table.clone(),
        )
        .await
        .unwrap();
        assert_eq!(handle.bound_port, 41000);
        assert_eq!(table.lookup("localhost", 41000).unwrap().local_port, 8087);

        handle.stop().await;
        handle.stop().await;
        assert_eq!(cancels.recv().await, Some(41000));
        assert!(table.is_empty());
        assert!(!handle.is_running());
        assert!(cancels.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ssh_disconnect_unregisters() {
        let (controller, _cancels) = forwarding_controller(2010);
        let table = RemoteForwardTable::new();

        let handle = start_remote_forward(
            controller.clone(),
            RemoteForward::new("localhost", 2010, "127.0.0.1", 8087),
            table.clone(),
        )
        .await
        .unwrap();

        controller.notify_disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_running());
        assert!(table.is_empty());
    }
}
