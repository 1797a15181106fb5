//! Proxy request head parsing
//!
//! The front end only needs the request head: method, target, headers. For
//! the WebSocket path the head is re-serialized for the destination, so
//! header order and spelling are preserved.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use super::error::RelayError;
use super::filter::split_destination;

/// Maximum number of headers to parse
const MAX_HEADERS: usize = 64;

/// Maximum size of a request head
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Parsed proxy request head
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    /// Request target as sent (`host:port`, absolute URI or origin path)
    pub target: String,
    /// Minor HTTP version (0 or 1)
    pub version: u8,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Bytes read past the end of the head
    pub leftover: Bytes,
}

impl ProxyRequest {
    /// Parse a request head; `Ok(None)` means more bytes are needed
    pub fn parse(data: &[u8]) -> Result<Option<(Self, usize)>, RelayError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req
            .parse(data)
            .map_err(|e| RelayError::BadRequest(e.to_string()))?
        {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let method = req
            .method
            .ok_or_else(|| RelayError::BadRequest("missing method".into()))?
            .to_string();
        let target = req
            .path
            .ok_or_else(|| RelayError::BadRequest("missing request target".into()))?
            .to_string();
        let headers = req
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();

        Ok(Some((
            ProxyRequest {
                method,
                target,
                version: req.version.unwrap_or(1),
                headers,
                leftover: Bytes::copy_from_slice(&data[head_len..]),
            },
            head_len,
        )))
    }

    /// Case-insensitive header lookup (first match)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `Upgrade: websocket` present (token match, case-insensitive)
    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
            })
            .unwrap_or(false)
    }

    /// Whether the relay reactor should take over this request
    pub fn wants_tunnel(&self) -> bool {
        self.is_connect() || self.is_websocket_upgrade()
    }

    /// Destination `host:port` of a tunnel request
    pub fn destination(&self) -> Result<(String, u16), RelayError> {
        if self.is_connect() {
            return split_destination(&self.target)
                .map(|(host, port)| (host.to_string(), port))
                .ok_or_else(|| {
                    RelayError::BadRequest(format!("invalid CONNECT authority '{}'", self.target))
                });
        }

        if let Some((scheme, rest)) = self.target.split_once("://") {
            let authority = rest.split(['/', '?']).next().unwrap_or_default();
            return parse_authority(authority, default_port(scheme)).ok_or_else(|| {
                RelayError::BadRequest(format!("invalid request target '{}'", self.target))
            });
        }

        let host = self
            .header("host")
            .ok_or_else(|| RelayError::BadRequest("missing Host header".into()))?;
        parse_authority(host, 80)
            .ok_or_else(|| RelayError::BadRequest(format!("invalid Host header '{}'", host)))
    }

    /// Origin-form target for forwarding (`/path?query`)
    pub fn origin_target(&self) -> String {
        match self.target.split_once("://") {
            Some((_, rest)) => match rest.find(['/', '?']) {
                Some(idx) if rest[idx..].starts_with('/') => rest[idx..].to_string(),
                Some(idx) => format!("/{}", &rest[idx..]),
                None => "/".to_string(),
            },
            None => self.target.clone(),
        }
    }

    /// Rebuild the request head for the destination
    ///
    /// Request line in origin form, headers in arrival order, unchanged.
    pub fn to_head_bytes(&self) -> Bytes {
        let mut head = BytesMut::with_capacity(256);
        head.extend_from_slice(
            format!(
                "{} {} HTTP/1.{}\r\n",
                self.method,
                self.origin_target(),
                self.version
            )
            .as_bytes(),
        );
        for (name, value) in &self.headers {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head.freeze()
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        443
    } else {
        80
    }
}

/// `host[:port]` with a fallback port
fn parse_authority(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority)
        .trim();
    if let Some((host, port)) = split_destination(authority) {
        return Some((host.to_string(), port));
    }
    let host = authority.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || (host.contains(':') && !authority.starts_with('[')) {
        return None;
    }
    Some((host.to_string(), default_port))
}

/// Read one request head from the client
///
/// Returns `Ok(None)` when the client closes before sending anything.
pub async fn read_request(stream: &mut TcpStream) -> Result<Option<ProxyRequest>, RelayError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(RelayError::BadRequest(
                "connection closed mid request head".into(),
            ));
        }

        if let Some((request, _)) = ProxyRequest::parse(&buf)? {
            return Ok(Some(request));
        }

        if buf.len() >= MAX_HEAD_SIZE {
            return Err(RelayError::BadRequest(format!(
                "request head exceeds {} bytes",
                MAX_HEAD_SIZE
            )));
        }
    }
}
