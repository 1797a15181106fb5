//! SSH module - the secure session under the tunnel
//!
//! Built on russh:
//! - Password or key authentication against the tunnel server
//! - Optional SHA-256 host key pinning
//! - Single-owner handle task for channels, forwards and keepalive probes

mod client;
mod config;
mod error;
mod handle_owner;

pub use client::{fingerprint, ClientHandler, SshClient};
pub use config::{AuthMethod, SshConfig};
pub use error::SshError;
pub use handle_owner::{
    spawn_handle_owner_task, HandleCommand, HandleController, PingResult, PING_TIMEOUT,
};
