//! Relay Session
//!
//! One client-facing half (downstream) paired with one destination-facing
//! half (upstream). The session is driven purely by socket readiness:
//!
//! ```text
//!   downstream readable ──read──▶ upstream.outbound ──writable──▶ upstream
//!   upstream   readable ──read──▶ downstream.outbound ──writable──▶ downstream
//! ```
//!
//! A half is only read while the opposite half has nothing queued, so a slow
//! peer applies backpressure to the fast one. Any close, error or idle timeout
//! tears down both halves.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::buffer_pool::{BufferPool, PooledBuffer};
use super::metrics::RelayMetrics;

/// Which side of the relay a half-connection faces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client side
    Downstream,
    /// Destination side
    Upstream,
}

impl Role {
    pub fn opposite(self) -> Role {
        match self {
            Role::Downstream => Role::Upstream,
            Role::Upstream => Role::Downstream,
        }
    }
}

/// Readiness a half-connection is polled for
///
/// A half is writable-interested while it has queued bytes, and
/// readable-interested while its peer has nothing queued from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    ReadWrite,
    /// Its last read is still queued on the peer
    Paused,
    Closed,
}

impl Interest {
    fn from_flags(read: bool, write: bool) -> Self {
        match (read, write) {
            (true, true) => Interest::ReadWrite,
            (true, false) => Interest::Read,
            (false, true) => Interest::Write,
            (false, false) => Interest::Paused,
        }
    }

    pub fn wants_read(self) -> bool {
        matches!(self, Interest::Read | Interest::ReadWrite)
    }

    pub fn wants_write(self) -> bool {
        matches!(self, Interest::Write | Interest::ReadWrite)
    }
}

/// Bytes queued for a half-connection
enum Outbound {
    /// Written before relaying starts (WebSocket head, pipelined bytes)
    Initial(Bytes),
    /// Read from the opposite half
    Relayed(PooledBuffer),
}

impl Outbound {
    fn as_slice(&self) -> &[u8] {
        match self {
            Outbound::Initial(bytes) => bytes,
            Outbound::Relayed(buf) => buf,
        }
    }
}

struct PendingWrite {
    data: Outbound,
    written: usize,
}

impl PendingWrite {
    fn remaining(&self) -> &[u8] {
        &self.data.as_slice()[self.written..]
    }
}

/// One side of a relay session
pub struct HalfConnection {
    role: Role,
    stream: TcpStream,
    interest: Interest,
    outbound: Option<PendingWrite>,
}

impl HalfConnection {
    pub fn new(role: Role, stream: TcpStream) -> Self {
        Self {
            role,
            stream,
            interest: Interest::Read,
            outbound: None,
        }
    }

    /// Queue bytes to be written before any relayed data
    pub fn with_pending(mut self, data: Bytes) -> Self {
        if !data.is_empty() {
            self.outbound = Some(PendingWrite {
                data: Outbound::Initial(data),
                written: 0,
            });
            self.interest = Interest::Write;
        }
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn has_pending(&self) -> bool {
        self.outbound.is_some()
    }
}

/// Why a relay session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Zero-byte read: the peer behind this half closed
    PeerClosed(Role),
    ReadError(Role),
    WriteError(Role),
    IdleTimeout,
    Cancelled,
}

/// Final accounting of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub reason: CloseReason,
    /// Client to destination
    pub bytes_up: u64,
    /// Destination to client
    pub bytes_down: u64,
}

enum Event {
    Readable(Role, io::Result<()>),
    Writable(Role, io::Result<()>),
    Idle,
    Cancelled,
}

/// A live relay between a client socket and a destination socket
pub struct RelaySession {
    id: u64,
    downstream: HalfConnection,
    upstream: HalfConnection,
    context: HashMap<String, String>,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

impl RelaySession {
    pub fn new(
        id: u64,
        downstream: HalfConnection,
        upstream: HalfConnection,
        idle_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        let mut session = Self {
            id,
            downstream,
            upstream,
            context: HashMap::new(),
            idle_timeout,
            connect_timeout,
        };
        session.refresh_interest();
        session
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Attach relay-scoped state
    pub fn set_context(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.insert(key.into(), value.into());
    }

    pub fn context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(String::as_str)
    }

    pub fn half(&self, role: Role) -> &HalfConnection {
        match role {
            Role::Downstream => &self.downstream,
            Role::Upstream => &self.upstream,
        }
    }

    /// (source, destination) for data read from `role`
    fn pair_mut(&mut self, role: Role) -> (&mut HalfConnection, &mut HalfConnection) {
        match role {
            Role::Downstream => (&mut self.downstream, &mut self.upstream),
            Role::Upstream => (&mut self.upstream, &mut self.downstream),
        }
    }

    fn half_mut(&mut self, role: Role) -> &mut HalfConnection {
        self.pair_mut(role).0
    }

    fn refresh_interest(&mut self) {
        let down_queued = self.downstream.outbound.is_some();
        let up_queued = self.upstream.outbound.is_some();
        self.downstream.interest = Interest::from_flags(!up_queued, down_queued);
        self.upstream.interest = Interest::from_flags(!down_queued, up_queued);
    }

    /// Drive the relay until either half closes, errors, times out or the
    /// token is cancelled. Both halves are closed on return.
    pub async fn run(
        mut self,
        pool: BufferPool,
        metrics: Arc<RelayMetrics>,
        cancel: CancellationToken,
    ) -> RelayOutcome {
        let mut bytes_up = 0u64;
        let mut bytes_down = 0u64;

        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);

        let reason = loop {
            self.refresh_interest();
            let down_read = self.downstream.interest.wants_read();
            let up_read = self.upstream.interest.wants_read();
            let down_write = self.downstream.interest.wants_write();
            let up_write = self.upstream.interest.wants_write();

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => Event::Cancelled,
                _ = &mut idle => Event::Idle,
                r = self.downstream.stream.writable(), if down_write => Event::Writable(Role::Downstream, r),
                r = self.upstream.stream.writable(), if up_write => Event::Writable(Role::Upstream, r),
                r = self.downstream.stream.readable(), if down_read => Event::Readable(Role::Downstream, r),
                r = self.upstream.stream.readable(), if up_read => Event::Readable(Role::Upstream, r),
            };

            match event {
                Event::Cancelled => break CloseReason::Cancelled,
                Event::Idle => break CloseReason::IdleTimeout,
                Event::Readable(role, Err(_)) => break CloseReason::ReadError(role),
                Event::Writable(role, Err(_)) => break CloseReason::WriteError(role),

                Event::Readable(role, Ok(())) => {
                    let mut buf = pool.acquire();
                    let (source, dest) = self.pair_mut(role);
                    match source.stream.try_read_buf(&mut *buf) {
                        Ok(0) => break CloseReason::PeerClosed(role),
                        Ok(n) => {
                            match role {
                                Role::Downstream => {
                                    bytes_up += n as u64;
                                    metrics.bytes_up.fetch_add(n as u64, Ordering::Relaxed);
                                }
                                Role::Upstream => {
                                    bytes_down += n as u64;
                                    metrics.bytes_down.fetch_add(n as u64, Ordering::Relaxed);
                                }
                            }
                            dest.outbound = Some(PendingWrite {
                                data: Outbound::Relayed(buf),
                                written: 0,
                            });
                            idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => {
                            debug!("Relay {} {:?} read error: {}", self.id, role, e);
                            break CloseReason::ReadError(role);
                        }
                    }
                }

                Event::Writable(role, Ok(())) => {
                    let half = self.half_mut(role);
                    let Some(pending) = half.outbound.as_mut() else {
                        continue;
                    };
                    match half.stream.try_write(pending.remaining()) {
                        Ok(0) => break CloseReason::WriteError(role),
                        Ok(n) => {
                            pending.written += n;
                            if pending.remaining().is_empty() {
                                // Drained: buffer goes back to the pool and
                                // the source is read again
                                half.outbound = None;
                            }
                            idle.as_mut().reset(Instant::now() + self.idle_timeout);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        Err(e) => {
                            debug!("Relay {} {:?} write error: {}", self.id, role, e);
                            break CloseReason::WriteError(role);
                        }
                    }
                }
            }
        };

        // A half is only read once its peer drained, so a clean close never
        // strands relayed bytes
        self.close().await;

        debug!(
            "Relay {} closed ({:?}, up={} down={})",
            self.id, reason, bytes_up, bytes_down
        );

        RelayOutcome {
            reason,
            bytes_up,
            bytes_down,
        }
    }

    /// Close both halves; never leaves one half open
    async fn close(&mut self) {
        for half in [&mut self.downstream, &mut self.upstream] {
            half.outbound = None;
            half.interest = Interest::Closed;
            let _ = half.stream.shutdown().await;
        }
    }
}
