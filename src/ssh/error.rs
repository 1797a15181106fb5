//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key mismatch: expected {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Forward error: {0}")]
    ForwardError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Retrying cannot fix these: the credentials or the server identity are wrong
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::AuthenticationFailed(_) | SshError::HostKeyMismatch { .. } | SshError::KeyError(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(SshError::AuthenticationFailed("rejected".into()).is_fatal());
        assert!(SshError::HostKeyMismatch {
            expected: "SHA256:a".into(),
            actual: "SHA256:b".into()
        }
        .is_fatal());
        assert!(!SshError::Timeout("handshake".into()).is_fatal());
        assert!(!SshError::Disconnected.is_fatal());
    }
}
