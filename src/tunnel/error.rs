//! Tunnel error types

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// Credentials or server identity rejected; never retried
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Forward error: {0}")]
    Forward(String),

    #[error("Tunnel manager stopped")]
    Stopped,
}

impl TunnelError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TunnelError::Auth(_))
    }
}

impl From<SshError> for TunnelError {
    fn from(err: SshError) -> Self {
        match err {
            e if e.is_fatal() => TunnelError::Auth(e.to_string()),
            SshError::ForwardError(msg) => TunnelError::Forward(msg),
            e => TunnelError::Session(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_error_mapping() {
        assert!(TunnelError::from(SshError::AuthenticationFailed("bad".into())).is_auth());
        assert!(matches!(
            TunnelError::from(SshError::ForwardError("port taken".into())),
            TunnelError::Forward(_)
        ));
        assert!(matches!(
            TunnelError::from(SshError::Timeout("handshake".into())),
            TunnelError::Session(_)
        ));
    }
}
