//! Relay counters
//!
//! Passed explicitly to the reactor so tests and embedders each get their own.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub requests: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub active_sessions: AtomicU64,
    pub rejected: AtomicU64,
    pub connect_failures: AtomicU64,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    pub requests: u64,
    pub sessions_opened: u64,
    pub active_sessions: u64,
    pub rejected: u64,
    pub connect_failures: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            requests: self.requests.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}
