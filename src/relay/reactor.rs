//! Relay Reactor
//!
//! Turns CONNECT and WebSocket-upgrade requests into raw byte relays:
//!
//! 1. Resolve the destination and run it through the [`DestinationFilter`]
//! 2. Dial it, bounded by the connect timeout
//! 3. Answer the client (CONNECT only) and hand both sockets to a
//!    [`RelaySession`] task
//!
//! Every session task owns its sockets. The reactor keeps a table of live
//! sessions for observation and cancellation; cancellation is delivered to the
//! owning task through its [`CancellationToken`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::buffer_pool::BufferPool;
use super::dialer::{Dialer, DirectDialer, UpstreamProxyDialer};
use super::error::RelayError;
use super::filter::DestinationFilter;
use super::metrics::RelayMetrics;
use super::request::ProxyRequest;
use super::session::{HalfConnection, RelaySession, Role};
use crate::config::AgentConfig;

/// Reply sent to the client once a CONNECT destination is reachable
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Relay mode, derived from the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    Connect,
    WebSocket,
}

/// Timeouts applied to every relay
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Bounds the destination connect only
    pub connect_timeout: Duration,
    /// No bytes in either direction for this long closes a live session
    pub idle_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Outcome of [`RelayReactor::handle`]
#[derive(Debug)]
pub enum Handled {
    /// A relay session now owns the client socket
    Tunneled { session_id: u64 },
    /// The client was answered with an error status and closed
    Refused { status: u16 },
    /// The client disconnected before the relay started
    ClientGone,
    /// Not a tunnel request; returned untouched
    Delegated {
        request: ProxyRequest,
        client: TcpStream,
    },
}

struct SessionEntry {
    target: String,
    mode: RelayMode,
    cancel: CancellationToken,
    started: Instant,
}

/// Snapshot of one live session
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: u64,
    pub target: String,
    pub mode: RelayMode,
    pub age_secs: u64,
}

struct ReactorInner {
    filter: DestinationFilter,
    dialer: Arc<dyn Dialer>,
    pool: BufferPool,
    metrics: Arc<RelayMetrics>,
    settings: RelaySettings,
    sessions: DashMap<u64, SessionEntry>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Shared handle to the relay core
#[derive(Clone)]
pub struct RelayReactor {
    inner: Arc<ReactorInner>,
}

impl RelayReactor {
    pub fn new(
        filter: DestinationFilter,
        dialer: Arc<dyn Dialer>,
        pool: BufferPool,
        metrics: Arc<RelayMetrics>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            inner: Arc::new(ReactorInner {
                filter,
                dialer,
                pool,
                metrics,
                settings,
                sessions: DashMap::new(),
                next_id: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Build the reactor described by an agent config
    pub fn from_config(config: &AgentConfig, metrics: Arc<RelayMetrics>) -> Self {
        let filter =
            DestinationFilter::from_lists(&config.allowed_destinations, &config.fast_fail_domains);
        let dialer: Arc<dyn Dialer> = match &config.upstream_proxy {
            Some(proxy) => {
                info!("Relaying through upstream proxy {}:{}", proxy.host, proxy.port);
                Arc::new(UpstreamProxyDialer::new(proxy.clone()))
            }
            None => Arc::new(DirectDialer),
        };
        Self::new(
            filter,
            dialer,
            BufferPool::with_buffer_size(config.buffer_size),
            metrics,
            RelaySettings {
                connect_timeout: config.connect_timeout(),
                idle_timeout: config.idle_timeout(),
            },
        )
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.inner.metrics
    }

    pub fn pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Take over a client if its request asks for a tunnel
    pub async fn handle(&self, request: ProxyRequest, mut client: TcpStream) -> Handled {
        if !request.wants_tunnel() {
            return Handled::Delegated { request, client };
        }
        self.inner.metrics.requests.fetch_add(1, Ordering::Relaxed);

        match self.open(&request).await {
            Ok((upstream, host, port)) => {
                let mode = if request.is_connect() {
                    RelayMode::Connect
                } else {
                    RelayMode::WebSocket
                };

                if mode == RelayMode::Connect {
                    if let Err(e) = client.write_all(CONNECT_ESTABLISHED).await {
                        debug!("Client went away before CONNECT reply: {}", e);
                        return Handled::ClientGone;
                    }
                }

                let session_id = self.spawn_session(request, mode, client, upstream, host, port);
                Handled::Tunneled { session_id }
            }
            Err(e) => {
                let status = e.status().unwrap_or(500);
                match &e {
                    RelayError::Rejected { .. } => {
                        self.inner.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!("{}", e);
                    }
                    RelayError::BadRequest(_) => debug!("{}", e),
                    _ => {
                        self.inner
                            .metrics
                            .connect_failures
                            .fetch_add(1, Ordering::Relaxed);
                        warn!("{}", e);
                    }
                }
                reply_status(&mut client, status).await;
                Handled::Refused { status }
            }
        }
    }

    /// Filter, then dial under the connect timeout
    async fn open(&self, request: &ProxyRequest) -> Result<(TcpStream, String, u16), RelayError> {
        let (host, port) = request.destination()?;
        if !self.inner.filter.permits(&host, port) {
            return Err(RelayError::Rejected { host, port });
        }

        let timeout = self.inner.settings.connect_timeout;
        let stream = tokio::time::timeout(timeout, self.inner.dialer.dial(&host, port))
            .await
            .map_err(|_| RelayError::ConnectTimeout {
                host: host.clone(),
                port,
                timeout,
            })??;
        Ok((stream, host, port))
    }

    fn spawn_session(
        &self,
        request: ProxyRequest,
        mode: RelayMode,
        client: TcpStream,
        upstream: TcpStream,
        host: String,
        port: u16,
    ) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let target = format!("{}:{}", host, port);

        // WebSocket: the original head goes to the destination first, whose
        // own 101 then flows back verbatim. CONNECT: only pipelined bytes.
        let pending = match mode {
            RelayMode::WebSocket => {
                let mut head = request.to_head_bytes().to_vec();
                head.extend_from_slice(&request.leftover);
                bytes::Bytes::from(head)
            }
            RelayMode::Connect => request.leftover.clone(),
        };

        let mut session = RelaySession::new(
            id,
            HalfConnection::new(Role::Downstream, client),
            HalfConnection::new(Role::Upstream, upstream).with_pending(pending),
            self.inner.settings.idle_timeout,
            self.inner.settings.connect_timeout,
        );
        session.set_context("target", target.clone());
        session.set_context("method", request.method.clone());

        let cancel = self.inner.shutdown.child_token();
        self.inner.sessions.insert(
            id,
            SessionEntry {
                target: target.clone(),
                mode,
                cancel: cancel.clone(),
                started: Instant::now(),
            },
        );
        self.inner.metrics.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.active_sessions.fetch_add(1, Ordering::Relaxed);

        debug!("Relay {} opened ({:?} {})", id, mode, target);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let _outcome = session
                .run(inner.pool.clone(), inner.metrics.clone(), cancel)
                .await;
            inner.sessions.remove(&id);
            inner.metrics.active_sessions.fetch_sub(1, Ordering::Relaxed);
        });

        id
    }

    /// Live sessions, oldest first
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .iter()
            .map(|entry| SessionInfo {
                id: *entry.key(),
                target: entry.target.clone(),
                mode: entry.mode,
                age_secs: entry.started.elapsed().as_secs(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Ask one session to tear down; returns false if it is not live
    pub fn cancel(&self, id: u64) -> bool {
        match self.inner.sessions.get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Tear down every live session; new ones may still be opened afterwards
    pub fn cancel_all(&self) {
        for entry in self.inner.sessions.iter() {
            entry.cancel.cancel();
        }
    }

    /// Tear down every live and future session
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Error",
    }
}

/// Write a bodiless status response and close the client
pub async fn reply_status(client: &mut TcpStream, status: u16) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status,
        reason_phrase(status)
    );
    if let Err(e) = client.write_all(response.as_bytes()).await {
        debug!("Failed to send {} to client: {}", status, e);
    }
    let _ = client.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Counts dial attempts, then dials directly
    #[derive(Default)]
    struct CountingDialer {
        dials: AtomicU64,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            DirectDialer.dial(host, port).await
        }
    }

    fn reactor_with(filter: DestinationFilter, dialer: Arc<dyn Dialer>) -> RelayReactor {
        RelayReactor::new(
            filter,
            dialer,
            BufferPool::with_buffer_size(4096),
            Arc::new(RelayMetrics::new()),
            RelaySettings {
                connect_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_secs(30),
            },
        )
    }

    /// Client socket connected to a local listener; returns (client side, proxy side)
    async fn client_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn request(raw: String) -> ProxyRequest {
        ProxyRequest::parse(raw.as_bytes()).unwrap().unwrap().0
    }

    async fn read_head(stream: &mut TcpStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(stream.read_u8().await.unwrap());
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn test_denied_destination_gets_403_without_dialing() {
        let mut filter = DestinationFilter::new();
        filter.deny("ads.example.com", 80);
        let dialer = Arc::new(CountingDialer::default());
        let reactor = reactor_with(filter, dialer.clone());

        let (mut client, proxy_side) = client_pair().await;
        let req = request("CONNECT ads.example.com:80 HTTP/1.1\r\nHost: ads.example.com:80\r\n\r\n".into());

        let handled = reactor.handle(req, proxy_side).await;
        assert!(matches!(handled, Handled::Refused { status: 403 }));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 403"));
        assert_eq!(reactor.metrics().snapshot().rejected, 1);
    }

    #[tokio::test]
    async fn test_websocket_upgrade_is_filtered_too() {
        let mut filter = DestinationFilter::new();
        filter.allow("ws.example.com", 443);
        let dialer = Arc::new(CountingDialer::default());
        let reactor = reactor_with(filter, dialer.clone());

        let (_client, proxy_side) = client_pair().await;
        let req = request(
            "GET /chat HTTP/1.1\r\nHost: other.example.com\r\nUpgrade: websocket\r\n\r\n".into(),
        );

        let handled = reactor.handle(req, proxy_side).await;
        assert!(matches!(handled, Handled::Refused { status: 403 }));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refused_connection_gets_500_within_timeout() {
        // Grab a free port, then close it so the connect is refused
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let reactor = reactor_with(DestinationFilter::new(), Arc::new(DirectDialer));

        let (mut client, proxy_side) = client_pair().await;
        let req = request(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n"));

        let started = Instant::now();
        let handled = reactor.handle(req, proxy_side).await;
        assert!(started.elapsed() <= Duration::from_secs(2));
        assert!(matches!(handled, Handled::Refused { status: 500 }));

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 500"));
        assert_eq!(reactor.metrics().snapshot().connect_failures, 1);
        assert_eq!(reactor.session_count(), 0);
    }

    /// Never completes a dial
    struct StallingDialer;

    #[async_trait]
    impl Dialer for StallingDialer {
        async fn dial(&self, _host: &str, _port: u16) -> Result<TcpStream, RelayError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(RelayError::UpstreamProxy("stalled".into()))
        }
    }

    #[tokio::test]
    async fn test_connect_timeout_gets_500_without_session() {
        let reactor = RelayReactor::new(
            DestinationFilter::new(),
            Arc::new(StallingDialer),
            BufferPool::with_buffer_size(4096),
            Arc::new(RelayMetrics::new()),
            RelaySettings {
                connect_timeout: Duration::from_millis(200),
                idle_timeout: Duration::from_secs(30),
            },
        );

        let (mut client, proxy_side) = client_pair().await;
        let req = request("CONNECT slow.example.com:443 HTTP/1.1\r\n\r\n".into());

        let started = Instant::now();
        let handled = reactor.handle(req, proxy_side).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(handled, Handled::Refused { status: 500 }));
        assert_eq!(reactor.session_count(), 0);

        let head = read_head(&mut client).await;
        assert!(head.starts_with("HTTP/1.1 500"));
        let stats = reactor.metrics().snapshot();
        assert_eq!(stats.connect_failures, 1);
        assert_eq!(stats.sessions_opened, 0);
    }

    #[tokio::test]
    async fn test_connect_relays_ping_pong() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = destination.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = destination.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(b"pong").await.unwrap();
            buf
        });

        let reactor = reactor_with(DestinationFilter::new(), Arc::new(DirectDialer));
        let (mut client, proxy_side) = client_pair().await;
        let req = request(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n"));

        let handled = reactor.handle(req, proxy_side).await;
        let Handled::Tunneled { session_id } = handled else {
            panic!("expected a tunnel");
        };

        let head = read_head(&mut client).await;
        assert_eq!(head.as_bytes(), CONNECT_ESTABLISHED);

        client.write_all(b"ping").await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let sessions = reactor.active_sessions();
        assert!(sessions.iter().all(|s| s.id == session_id && s.mode == RelayMode::Connect));
    }

    #[tokio::test]
    async fn test_websocket_head_forwarded_and_101_passed_back() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = destination.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut sock, _) = destination.accept().await.unwrap();
            let head = read_head(&mut sock).await;
            sock.write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n")
                .await
                .unwrap();
            head
        });

        let reactor = reactor_with(DestinationFilter::new(), Arc::new(DirectDialer));
        let (mut client, proxy_side) = client_pair().await;
        let req = request(format!(
            "GET ws://127.0.0.1:{port}/socket HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\
             Upgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
        ));

        let handled = reactor.handle(req, proxy_side).await;
        assert!(matches!(handled, Handled::Tunneled { .. }));

        let forwarded = server.await.unwrap();
        assert!(forwarded.starts_with("GET /socket HTTP/1.1\r\n"));
        assert!(forwarded.contains("Upgrade: websocket\r\n"));

        let reply = read_head(&mut client).await;
        assert!(reply.starts_with("HTTP/1.1 101 Switching Protocols"));
    }

    #[tokio::test]
    async fn test_plain_request_is_delegated() {
        let dialer = Arc::new(CountingDialer::default());
        let reactor = reactor_with(DestinationFilter::new(), dialer.clone());
        let (_client, proxy_side) = client_pair().await;
        let req = request("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n".into());

        let handled = reactor.handle(req, proxy_side).await;
        assert!(matches!(handled, Handled::Delegated { .. }));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
        assert_eq!(reactor.metrics().snapshot().requests, 0);
    }

    #[tokio::test]
    async fn test_idle_session_closed_after_delivering_data() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = destination.local_addr().unwrap().port();

        let reactor = RelayReactor::new(
            DestinationFilter::new(),
            Arc::new(DirectDialer),
            BufferPool::default(),
            Arc::new(RelayMetrics::new()),
            RelaySettings {
                connect_timeout: Duration::from_secs(2),
                idle_timeout: Duration::from_millis(300),
            },
        );
        let (mut client, proxy_side) = client_pair().await;
        let req = request(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n"));

        let (handled, accepted) = tokio::join!(reactor.handle(req, proxy_side), destination.accept());
        assert!(matches!(handled, Handled::Tunneled { .. }));
        let (mut server, _) = accepted.unwrap();
        read_head(&mut client).await;

        client.write_all(b"payload").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"payload");

        // Nothing more either way: both halves see EOF
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
        assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reactor.session_count(), 0);
        assert_eq!(reactor.metrics().snapshot().bytes_up, 7);
    }

    #[tokio::test]
    async fn test_cancel_marshals_teardown_to_session() {
        let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = destination.local_addr().unwrap().port();

        let reactor = reactor_with(DestinationFilter::new(), Arc::new(DirectDialer));
        let (mut client, proxy_side) = client_pair().await;
        let req = request(format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n"));

        let (handled, accepted) = tokio::join!(reactor.handle(req, proxy_side), destination.accept());
        let Handled::Tunneled { session_id } = handled else {
            panic!("expected a tunnel");
        };
        let (mut server, _) = accepted.unwrap();
        read_head(&mut client).await;

        assert!(reactor.cancel(session_id));
        let mut rest = Vec::new();
        assert_eq!(server.read_to_end(&mut rest).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reactor.cancel(session_id));
        assert_eq!(reactor.metrics().snapshot().active_sessions, 0);
    }
}
