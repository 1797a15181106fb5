//! Outbound connections for the relay
//!
//! Either straight to the destination, or through a corporate HTTP proxy
//! using its own CONNECT.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::error::RelayError;
use crate::config::UpstreamProxyConfig;

/// Opens the destination-facing socket of a relay session
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, RelayError>;
}

/// Connects directly to the destination
#[derive(Debug, Clone, Default)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| RelayError::ConnectFailed {
                host: host.to_string(),
                port,
                source,
            })?;
        set_nodelay(&stream);
        Ok(stream)
    }
}

/// Connects through an upstream HTTP proxy
#[derive(Debug, Clone)]
pub struct UpstreamProxyDialer {
    proxy: UpstreamProxyConfig,
}

/// Cap on the upstream proxy's CONNECT response head
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

impl UpstreamProxyDialer {
    pub fn new(proxy: UpstreamProxyConfig) -> Self {
        Self { proxy }
    }

    fn connect_request(&self, host: &str, port: u16) -> String {
        let mut request = format!(
            "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
            host = host,
            port = port
        );
        if let Some(user) = &self.proxy.username {
            let password = self.proxy.password.as_deref().unwrap_or_default();
            let token = BASE64.encode(format!("{}:{}", user, password));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }
        request.push_str("\r\n");
        request
    }
}

#[async_trait]
impl Dialer for UpstreamProxyDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, RelayError> {
        let mut stream = TcpStream::connect((self.proxy.host.as_str(), self.proxy.port))
            .await
            .map_err(|source| RelayError::ConnectFailed {
                host: self.proxy.host.clone(),
                port: self.proxy.port,
                source,
            })?;
        set_nodelay(&stream);

        debug!(
            "Requesting {}:{} through upstream proxy {}:{}",
            host, port, self.proxy.host, self.proxy.port
        );
        stream
            .write_all(self.connect_request(host, port).as_bytes())
            .await?;

        // Byte-wise so nothing past the response head is consumed
        let mut head = BytesMut::with_capacity(256);
        while !head.ends_with(b"\r\n\r\n") {
            if head.len() >= MAX_PROXY_RESPONSE {
                return Err(RelayError::UpstreamProxy(
                    "oversized CONNECT response".into(),
                ));
            }
            let byte = stream.read_u8().await.map_err(|e| {
                RelayError::UpstreamProxy(format!("connection closed during CONNECT: {}", e))
            })?;
            head.extend_from_slice(&[byte]);
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut response = httparse::Response::new(&mut headers);
        response
            .parse(&head)
            .map_err(|e| RelayError::UpstreamProxy(e.to_string()))?;

        match response.code {
            Some(code) if (200..300).contains(&code) => Ok(stream),
            Some(code) => {
                warn!(
                    "Upstream proxy refused CONNECT {}:{} with {}",
                    host, port, code
                );
                Err(RelayError::UpstreamProxy(format!(
                    "proxy answered {} {}",
                    code,
                    response.reason.unwrap_or_default()
                )))
            }
            None => Err(RelayError::UpstreamProxy("malformed CONNECT response".into())),
        }
    }
}

fn set_nodelay(stream: &TcpStream) {
    // Disable Nagle's algorithm for low-latency relaying
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_connect_request_with_credentials() {
        let dialer = UpstreamProxyDialer::new(UpstreamProxyConfig {
            host: "proxy.corp".into(),
            port: 3128,
            username: Some("alice".into()),
            password: Some("s3cret".into()),
        });
        let request = dialer.connect_request("hub.example.com", 443);
        assert!(request.starts_with("CONNECT hub.example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode("alice:s3cret")
        )));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_upstream_proxy_handshake() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut sock, _) = proxy.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            sock.write_all(b"tunneled").await.unwrap();
            request
        });

        let dialer = UpstreamProxyDialer::new(UpstreamProxyConfig {
            host: "127.0.0.1".into(),
            port: proxy_port,
            username: None,
            password: None,
        });
        let mut stream = dialer.dial("dest.example.com", 8443).await.unwrap();

        let mut buf = [0u8; 8];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunneled");

        let request = server.await.unwrap();
        assert!(request.starts_with("CONNECT dest.example.com:8443 HTTP/1.1"));
        assert!(!request.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_upstream_proxy_refusal() {
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_port = proxy.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = proxy.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let dialer = UpstreamProxyDialer::new(UpstreamProxyConfig {
            host: "127.0.0.1".into(),
            port: proxy_port,
            username: None,
            password: None,
        });
        let result = dialer.dial("dest.example.com", 443).await;
        assert!(matches!(result, Err(RelayError::UpstreamProxy(_))));
    }
}
