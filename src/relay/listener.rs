//! Proxy Listener
//!
//! Minimal HTTP front end on the local proxy port. Each accepted client gets
//! its request head parsed; tunnel requests go to the [`RelayReactor`], the
//! rest to an [`HttpDelegate`]. A [`RelayGate`] pauses accepting while the
//! tunnel is down without tearing the listener down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::error::RelayError;
use super::reactor::{reply_status, Handled, RelayReactor};
use super::request::{read_request, ProxyRequest};

/// Time allowed for a client to send its request head
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Handler for requests that are neither CONNECT nor WebSocket upgrades
#[async_trait]
pub trait HttpDelegate: Send + Sync {
    async fn serve(&self, request: ProxyRequest, client: TcpStream);
}

/// Answers every delegated request with `501 Not Implemented`
#[derive(Debug, Clone, Default)]
pub struct NotImplementedDelegate;

#[async_trait]
impl HttpDelegate for NotImplementedDelegate {
    async fn serve(&self, request: ProxyRequest, mut client: TcpStream) {
        debug!("No handler for {} {}", request.method, request.target);
        reply_status(&mut client, 501).await;
    }
}

/// Pause/resume switch for the proxy front end
#[derive(Clone)]
pub struct RelayGate {
    tx: Arc<watch::Sender<bool>>,
}

impl RelayGate {
    pub fn new(open: bool) -> Self {
        let (tx, _rx) = watch::channel(open);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        if self.tx.send_replace(false) {
            info!("Relay front end paused");
        }
    }

    pub fn resume(&self) {
        if !self.tx.send_replace(true) {
            info!("Relay front end resumed");
        }
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the gate is open
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so this cannot fail while we wait
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for RelayGate {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Handle to a running proxy listener
pub struct ProxyListenerHandle {
    /// Actual bound address (port may differ from requested if it was 0)
    pub local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    accepted: Arc<AtomicU64>,
}

impl ProxyListenerHandle {
    /// Stop accepting; live relay sessions are left to the reactor
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Stopping proxy listener on {}", self.local_addr);
            let _ = self.stop_tx.send(()).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// Bind the proxy port and spawn the accept loop
pub async fn start_proxy_listener(
    bind_addr: &str,
    reactor: RelayReactor,
    delegate: Arc<dyn HttpDelegate>,
    gate: RelayGate,
) -> Result<ProxyListenerHandle, RelayError> {
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => RelayError::Bind(format!(
            "Port already in use: {}. Another application may be using this port.",
            bind_addr
        )),
        std::io::ErrorKind::PermissionDenied => RelayError::Bind(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            bind_addr
        )),
        _ => RelayError::Bind(format!("Failed to bind to {}: {}", bind_addr, e)),
    })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| RelayError::Bind(format!("Failed to get bound address: {}", e)))?;

    info!("Proxy listener started on {}", local_addr);

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let accepted = Arc::new(AtomicU64::new(0));
    let accepted_clone = accepted.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    info!("Proxy listener stopped by request");
                    break;
                }

                // Paused: pending clients wait in the accept backlog
                accept_result = async {
                    gate.wait_open().await;
                    listener.accept().await
                } => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_clone.load(Ordering::SeqCst) {
                                break;
                            }
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }
                            debug!("Accepted proxy client {}", peer_addr);
                            accepted_clone.fetch_add(1, Ordering::Relaxed);

                            let reactor = reactor.clone();
                            let delegate = delegate.clone();
                            tokio::spawn(async move {
                                serve_client(stream, reactor, delegate).await;
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
        info!("Proxy listener task exited");
    });

    Ok(ProxyListenerHandle {
        local_addr,
        running,
        stop_tx,
        accepted,
    })
}

async fn serve_client(
    mut stream: TcpStream,
    reactor: RelayReactor,
    delegate: Arc<dyn HttpDelegate>,
) {
    let request = match tokio::time::timeout(REQUEST_HEAD_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!("Unreadable request head: {}", e);
            if let Some(status) = e.status() {
                reply_status(&mut stream, status).await;
            }
            return;
        }
        Err(_) => {
            debug!("Client sent no request head within {:?}", REQUEST_HEAD_TIMEOUT);
            return;
        }
    };

    if let Handled::Delegated { request, client } = reactor.handle(request, stream).await {
        delegate.serve(request, client).await;
    }
}
