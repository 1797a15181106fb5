//! Relay Module
//!
//! Local proxy core: CONNECT and WebSocket-upgrade requests become raw byte
//! relays between the client socket and the destination socket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   head    ┌────────────────┐  filter + dial  ┌──────────────┐
//! │  client  │ ────────▶ │ ProxyListener  │ ──────────────▶ │ RelayReactor │
//! └──────────┘           └────────────────┘                 └──────┬───────┘
//!      ▲                        │ other methods                    │ spawn
//!      │                        ▼                                  ▼
//!      │                 ┌──────────────┐                   ┌──────────────┐
//!      └──────────────── │ HttpDelegate │                   │ RelaySession │ ◀──▶ destination
//!                        └──────────────┘                   └──────────────┘
//! ```

pub mod buffer_pool;
pub mod dialer;
pub mod error;
pub mod filter;
pub mod listener;
pub mod metrics;
pub mod reactor;
pub mod request;
pub mod session;

pub use buffer_pool::{BufferPool, BufferPoolConfig, PooledBuffer};
pub use dialer::{Dialer, DirectDialer, UpstreamProxyDialer};
pub use error::RelayError;
pub use filter::{split_destination, DestinationFilter};
pub use listener::{
    start_proxy_listener, HttpDelegate, NotImplementedDelegate, ProxyListenerHandle, RelayGate,
};
pub use metrics::{RelayMetrics, RelayStats};
pub use reactor::{Handled, RelayMode, RelayReactor, RelaySettings, SessionInfo};
pub use request::ProxyRequest;
pub use session::{CloseReason, HalfConnection, Interest, RelayOutcome, RelaySession, Role};
