//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Forwards and the liveness
//! check talk to it through a [`HandleController`], which sends commands over
//! an mpsc channel. Nothing ever locks the handle.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id);
//! let bound_port = controller.tcpip_forward("localhost", 2010).await?;
//! let channel = controller.open_direct_tcpip("localhost", 80, "127.0.0.1", 0).await?;
//! ```

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// Upper bound for one keepalive round trip
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a keepalive probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Server answered
    Ok,
    /// No answer in time; may be transient latency
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (local-bind forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    /// Keepalive probe
    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Cloneable command sender for the Handle Owner Task
///
/// Holding one grants full control over the connection; it never leaves the
/// process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task exits
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Controller over an arbitrary command channel; used by tests to stand
    /// in for a live connection
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }

    /// Receiver that gets `()` when the SSH connection closes
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Broadcast a disconnect to every subscriber
    pub fn notify_disconnect(&self) {
        let _ = self.disconnect_tx.send(());
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Request remote port forward (tcpip-forward)
    ///
    /// Returns the actual bound port (may differ if requested port was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardError(e.to_string()))
    }

    /// Cancel a remote port forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ForwardError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Keepalive probe; a closed owner task reads as `IoError`
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Whether the owner task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Takes ownership of the handle; the returned controller is the only way to
/// reach it.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    session_id: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut handle = handle;

        info!("Handle owner task started for session {}", session_id);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                HandleCommand::ChannelOpenDirectTcpip {
                    host,
                    port,
                    originator_host,
                    originator_port,
                    reply_tx,
                } => {
                    let result = handle
                        .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                        .await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving direct_tcpip result");
                    }
                }

                HandleCommand::TcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.tcpip_forward(&address, port).await;
                    match result {
                        Ok(bound_port) => {
                            if reply_tx.send(Ok(bound_port)).is_err() {
                                // Nobody will ever cancel it otherwise
                                warn!(
                                    "Caller dropped after tcpip_forward succeeded. \
                                     Cancelling orphaned forward {}:{}",
                                    address, bound_port
                                );
                                let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                            }
                        }
                        Err(e) => {
                            let _ = reply_tx.send(Err(e));
                        }
                    }
                }

                HandleCommand::CancelTcpipForward {
                    address,
                    port,
                    reply_tx,
                } => {
                    let result = handle.cancel_tcpip_forward(&address, port).await;
                    if reply_tx.send(result).is_err() {
                        warn!("Caller dropped before receiving cancel_tcpip_forward result");
                    }
                }

                HandleCommand::Ping { reply_tx } => {
                    // keepalive@openssh.com with want_reply=true
                    debug!("Keepalive probe for session {}", session_id);
                    let result =
                        match tokio::time::timeout(PING_TIMEOUT, handle.send_keepalive(true)).await {
                            Ok(Ok(())) => PingResult::Ok,
                            Ok(Err(russh::Error::Disconnect)) => {
                                warn!("Keepalive found session {} disconnected", session_id);
                                PingResult::IoError
                            }
                            Ok(Err(e)) => {
                                warn!(
                                    "Keepalive error for session {} (soft failure): {:?}",
                                    session_id, e
                                );
                                PingResult::Timeout
                            }
                            Err(_) => {
                                warn!(
                                    "Keepalive timeout for session {} ({}s)",
                                    session_id,
                                    PING_TIMEOUT.as_secs()
                                );
                                PingResult::Timeout
                            }
                        };
                    let _ = reply_tx.send(result);
                }

                HandleCommand::Disconnect => {
                    info!("Disconnect requested for session {}", session_id);
                    break;
                }
            }
        }

        // Forwards listen for this to stop themselves
        let _ = disconnect_tx_clone.send(());

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Answer every queued command with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_owner_reads_as_disconnected() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);
        assert!(controller.is_connected());

        drop(cmd_rx);
        assert!(!controller.is_connected());
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert!(matches!(
            controller.tcpip_forward("localhost", 2010).await,
            Err(SshError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_drain_answers_queued_commands() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);

        let (ping_tx, ping_rx) = oneshot::channel();
        let (fwd_tx, fwd_rx) = oneshot::channel();
        cmd_tx
            .send(HandleCommand::Ping { reply_tx: ping_tx })
            .await
            .unwrap();
        cmd_tx
            .send(HandleCommand::TcpipForward {
                address: "localhost".into(),
                port: 2010,
                reply_tx: fwd_tx,
            })
            .await
            .unwrap();
        cmd_tx.send(HandleCommand::Disconnect).await.unwrap();

        drain_pending_commands(&mut cmd_rx);

        assert_eq!(ping_rx.await.unwrap(), PingResult::IoError);
        assert!(matches!(fwd_rx.await.unwrap(), Err(russh::Error::Disconnect)));
        assert!(cmd_tx.send(HandleCommand::Disconnect).await.is_err());
    }

    #[tokio::test]
    async fn test_controller_round_trip() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let controller = HandleController::new(cmd_tx);

        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    HandleCommand::Ping { reply_tx } => {
                        let _ = reply_tx.send(PingResult::Timeout);
                    }
                    HandleCommand::TcpipForward { reply_tx, .. } => {
                        let _ = reply_tx.send(Ok(40123));
                    }
                    _ => {}
                }
            }
        });

        assert_eq!(controller.ping().await, PingResult::Timeout);
        assert_eq!(controller.tcpip_forward("localhost", 0).await.unwrap(), 40123);
    }

    #[tokio::test]
    async fn test_notify_disconnect_reaches_subscribers() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let controller = HandleController::new(cmd_tx);
        let mut rx = controller.subscribe_disconnect();
        controller.clone().notify_disconnect();
        assert!(rx.recv().await.is_ok());
    }
}
