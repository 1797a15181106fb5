//! Tunnel resilience
//!
//! [`TunnelManager`] keeps one secure session alive and asks for a rebuild
//! when it cannot; [`session`] holds the transport seam and its russh
//! implementation.

mod error;
mod manager;
pub mod session;
mod status;

pub use error::TunnelError;
pub use manager::{ManagerSettings, RebuildHook, TunnelManager, HEARTBEAT_FAIL_THRESHOLD};
pub use session::{
    ActiveForward, ForwardSpec, SecureConnector, SecureSession, SshTunnelConnector,
    SshTunnelSession, TunnelSession,
};
pub use status::{RetryState, TunnelEvent, TunnelState, TunnelStatus};
