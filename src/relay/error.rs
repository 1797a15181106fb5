//! Relay error types

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Destination {host}:{port} is not permitted")]
    Rejected { host: String, port: u16 },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Connect to {host}:{port} failed: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Connect to {host}:{port} timed out after {timeout:?}")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Upstream proxy error: {0}")]
    UpstreamProxy(String),

    #[error("Failed to bind proxy listener: {0}")]
    Bind(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// HTTP status to answer the client with, if the client can still get one
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Rejected { .. } => Some(403),
            RelayError::BadRequest(_) => Some(400),
            RelayError::ConnectFailed { .. }
            | RelayError::ConnectTimeout { .. }
            | RelayError::UpstreamProxy(_) => Some(500),
            RelayError::Bind(_) | RelayError::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let rejected = RelayError::Rejected {
            host: "ads.example.com".into(),
            port: 80,
        };
        assert_eq!(rejected.status(), Some(403));

        let timeout = RelayError::ConnectTimeout {
            host: "slow.example.com".into(),
            port: 443,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.status(), Some(500));

        let io = RelayError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(io.status(), None);
    }
}
