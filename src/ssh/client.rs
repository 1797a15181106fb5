//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::*;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use crate::forwarding::remote::{handle_forwarded_connection, RemoteForwardTable};

/// `SHA256:<unpadded base64>` fingerprint, as printed by `ssh-keygen -l`
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_bytes(&key.public_key_bytes())
}

fn fingerprint_bytes(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Opens authenticated SSH connections to a tunnel server
pub struct SshClient {
    config: SshConfig,
    forwards: RemoteForwardTable,
}

impl SshClient {
    /// `forwards` is consulted for every forwarded-tcpip channel the server
    /// opens on this connection
    pub fn new(config: SshConfig, forwards: RemoteForwardTable) -> Self {
        Self { config, forwards }
    }

    /// Connect and authenticate
    pub async fn connect(self) -> Result<client::Handle<ClientHandler>, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("Connecting to SSH server at {}", addr);

        let ssh_config = client::Config {
            // Liveness is the resilience manager's job
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(self.config.keepalive_interval_secs)),
            keepalive_max: self.config.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.host_key_fingerprint.clone(),
            self.forwards.clone(),
        );

        let mut handle = tokio::time::timeout(
            self.config.timeout(),
            client::connect(
                Arc::new(ssh_config),
                (self.config.host.as_str(), self.config.port),
                handler,
            ),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| match e {
            // Keep the pin mismatch distinguishable from network trouble
            SshError::HostKeyMismatch { .. } => e,
            other => SshError::ConnectionFailed(other.to_string()),
        })?;

        debug!("SSH handshake completed");

        let authenticated = match &self.config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&self.config.username, password)
                .await
                .map_err(auth_transport_error)?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(key_path, passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&self.config.username, key_with_hash)
                    .await
                    .map_err(auth_transport_error)?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", self.config.username);

        Ok(handle)
    }
}

/// An auth request that errored never got a verdict from the server, so it is
/// retryable; only an explicit rejection is `AuthenticationFailed`
fn auth_transport_error(err: russh::Error) -> SshError {
    SshError::ConnectionFailed(format!("Authentication exchange failed: {}", err))
}

/// Client handler for russh callbacks
///
/// - Host key check against an optional fingerprint pin
/// - forwarded-tcpip channels bridged to the target registered for them
pub struct ClientHandler {
    host: String,
    port: u16,
    pinned_fingerprint: Option<String>,
    forwards: RemoteForwardTable,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        pinned_fingerprint: Option<String>,
        forwards: RemoteForwardTable,
    ) -> Self {
        Self {
            host,
            port,
            pinned_fingerprint,
            forwards,
        }
    }

    fn verify_fingerprint(&self, actual: String) -> Result<bool, SshError> {
        match &self.pinned_fingerprint {
            Some(expected) if *expected != actual => {
                warn!(
                    "HOST KEY MISMATCH for {}:{}! Expected {}, got {}",
                    self.host, self.port, expected, actual
                );
                Err(SshError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual,
                })
            }
            Some(_) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            None => {
                debug!(
                    "No host key pin for {}:{}, accepting {}",
                    self.host, self.port, actual
                );
                Ok(true)
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verify_fingerprint(fingerprint(server_public_key))
    }

    /// Server opened a channel for a connection to one of our remote-bind ports
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let forwards = self.forwards.clone();
        let connected_address = connected_address.to_string();
        let originator_address = originator_address.to_string();

        // Called from the SSH event loop: never block it
        tokio::spawn(async move {
            if let Err(e) = handle_forwarded_connection(
                &forwards,
                channel,
                &connected_address,
                connected_port,
                &originator_address,
                originator_port,
            )
            .await
            {
                warn!(
                    "Failed to handle forwarded connection {}:{}: {}",
                    connected_address, connected_port, e
                );
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(pin: Option<&str>) -> ClientHandler {
        ClientHandler::new(
            "tunnel.example.net".into(),
            22,
            pin.map(String::from),
            RemoteForwardTable::new(),
        )
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_bytes(b"not a real key blob");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        // 32-byte digest -> 43 unpadded base64 chars
        assert_eq!(fp.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn test_unpinned_accepts_any_key() {
        assert!(handler(None).verify_fingerprint("SHA256:anything".into()).unwrap());
    }

    #[test]
    fn test_pin_match_and_mismatch() {
        let fp = fingerprint_bytes(b"server key");
        assert!(handler(Some(&fp)).verify_fingerprint(fp.clone()).unwrap());

        let err = handler(Some("SHA256:other"))
            .verify_fingerprint(fp)
            .unwrap_err();
        assert!(matches!(err, SshError::HostKeyMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_auth_transport_errors_are_retryable() {
        let err = auth_transport_error(russh::Error::Disconnect);
        assert!(matches!(err, SshError::ConnectionFailed(_)));
        assert!(!err.is_fatal());
        assert!(!crate::tunnel::TunnelError::from(err).is_auth());
    }
}
