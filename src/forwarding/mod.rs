//! Port Forwarding Module
//!
//! The two forwards every tunnel session installs:
//! - **Local-bind**: local port -> direct-tcpip channel -> hub endpoint on the far side
//! - **Remote-bind**: server-side port -> forwarded-tcpip channel -> local relay proxy
//!
//! Both stop on their own when the SSH connection drops; the resilience
//! manager reinstalls them on reconnect.

pub mod bridge;
pub mod local;
pub mod remote;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub use local::{start_local_forward, LocalForward, LocalForwardHandle};
pub use remote::{
    handle_forwarded_connection, start_remote_forward, RemoteForward, RemoteForwardHandle,
    RemoteForwardTable,
};

/// Statistics for a port forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Active connections right now
    pub active_connections: u64,
    /// Total bytes sent (local -> SSH)
    pub bytes_sent: u64,
    /// Total bytes received (SSH -> local)
    pub bytes_received: u64,
}

/// Lock-free counters behind [`ForwardStats`]
#[derive(Debug, Default)]
pub struct ForwardCounters {
    pub connection_count: AtomicU64,
    pub active_connections: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
}

impl ForwardCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) {
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn closed(&self) {
        // Saturating: a close never drives the gauge below zero
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn snapshot(&self) -> ForwardStats {
        ForwardStats {
            connection_count: self.connection_count.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Wait up to `timeout` for in-flight forward connections to finish
pub(crate) async fn wait_for_drain(counters: &ForwardCounters, timeout: std::time::Duration, label: &str) {
    let start = std::time::Instant::now();
    while counters.active_connections.load(Ordering::SeqCst) > 0 {
        if start.elapsed() > timeout {
            tracing::warn!(
                "Timeout waiting for {} active connections to close on {}",
                counters.active_connections.load(Ordering::SeqCst),
                label
            );
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
