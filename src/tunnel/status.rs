//! Tunnel state, status and events

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Lifecycle of one resilience manager instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Created, `start()` not called yet
    Idle,
    Connecting,
    Connected,
    /// Liveness check failed; retry timer armed
    Lost,
    /// A reconnect attempt is in flight or the next one is scheduled
    Retrying,
    /// Retry budget exhausted or credentials rejected; rebuild requested
    GaveUp,
    Stopped,
}

impl TunnelState {
    /// No further transitions happen once reached
    pub fn is_terminal(&self) -> bool {
        matches!(self, TunnelState::GaveUp | TunnelState::Stopped)
    }
}

/// Read-only view of the tunnel published to the rest of the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub live: bool,
    /// Id of the current secure session
    pub session_id: Option<String>,
    /// Local port of the hub forward
    pub local_port: Option<u16>,
}

/// Notifications from the resilience manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Connected { session_id: String },
    /// The liveness check found the session down
    Lost { session_id: String },
    /// A reconnect attempt failed; `attempt` is the failure count so far
    Retrying { attempt: u32, max_attempts: u32 },
    /// Reconnected; `attempts` counts the attempts it took
    Recovered { session_id: String, attempts: u32 },
    /// Retry budget exhausted or authentication failed
    GaveUp { reason: String },
    Stopped,
}

/// Fixed-delay reconnect bookkeeping
///
/// `retrying()` is true exactly while a reconnect timer is pending, and
/// `attempts` only moves while retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub delay: Duration,
    pub max_attempts: u32,
    deadline: Option<Instant>,
}

impl RetryState {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            delay,
            max_attempts,
            deadline: None,
        }
    }

    pub fn retrying(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Arm a fresh one-shot timer `delay` from now
    pub fn schedule(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    /// Count a failed attempt; false once the budget is spent
    pub fn record_failure(&mut self) -> bool {
        if self.retrying() {
            self.attempts += 1;
        }
        self.attempts < self.max_attempts
    }

    /// Back to idle: no timer, no attempts
    pub fn reset(&mut self) {
        self.deadline = None;
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_state_invariants() {
        let mut retry = RetryState::new(Duration::from_secs(5), 3);
        assert!(!retry.retrying());

        // Not retrying: attempts do not move
        assert!(retry.record_failure());
        assert_eq!(retry.attempts, 0);

        retry.schedule();
        assert!(retry.retrying());
        assert!(retry.record_failure());
        assert!(retry.record_failure());
        assert!(!retry.record_failure());
        assert_eq!(retry.attempts, 3);

        retry.reset();
        assert!(!retry.retrying());
        assert_eq!(retry.attempts, 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(TunnelState::GaveUp.is_terminal());
        assert!(TunnelState::Stopped.is_terminal());
        assert!(!TunnelState::Retrying.is_terminal());
    }
}
