//! OxideTunnel - local tunnel agent
//!
//! Opens an SSH tunnel to a cloud browser-testing grid and exposes it to local
//! tooling through a CONNECT / WebSocket relay proxy.
//!
//! - [`tunnel`]: connection resilience (heartbeat, liveness, fixed-delay reconnect)
//! - [`relay`]: destination filter, buffer pool and the relay reactor
//! - [`ssh`] / [`forwarding`]: russh session plumbing and port forwards
//! - [`agent`]: orchestration and full tunnel rebuild

pub mod agent;
pub mod config;
pub mod forwarding;
pub mod relay;
pub mod ssh;
pub mod tunnel;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// `RUST_LOG` wins when set; otherwise `debug` turns on verbose output.
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
