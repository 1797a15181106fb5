//! SSH Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AgentConfig;

/// SSH connection configuration for one tunnel server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Tunnel server address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Transport keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed transport keepalives before russh drops the connection
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// Expected `SHA256:` host key fingerprint; any key is accepted when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

/// Authentication methods supported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file
        key_path: String,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

impl SshConfig {
    /// Config for a tunnel server, authenticating with the grid credentials
    pub fn for_tunnel(
        host: impl Into<String>,
        username: impl Into<String>,
        agent: &AgentConfig,
    ) -> Self {
        Self {
            host: host.into(),
            port: agent.ssh_port,
            username: username.into(),
            auth: AuthMethod::password(agent.api_secret.clone()),
            timeout_secs: agent.ssh_timeout_secs,
            host_key_fingerprint: agent.host_key_fingerprint.clone(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: AuthMethod::Password {
                password: String::new(),
            },
            timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            host_key_fingerprint: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_tunnel_uses_grid_credentials() {
        let agent = AgentConfig {
            api_key: "user".into(),
            api_secret: "secret".into(),
            ssh_port: 2222,
            host_key_fingerprint: Some("SHA256:pinned".into()),
            ..Default::default()
        };
        let config = SshConfig::for_tunnel("tunnel-7.example.net", "user", &agent);
        assert_eq!(config.port, 2222);
        assert_eq!(config.username, "user");
        assert!(matches!(config.auth, AuthMethod::Password { ref password } if password == "secret"));
        assert_eq!(config.host_key_fingerprint.as_deref(), Some("SHA256:pinned"));
        assert_eq!(config.keepalive_max, 3);
    }

    #[test]
    fn test_auth_method_json_shape() {
        let auth: AuthMethod =
            serde_json::from_str(r#"{"type":"key","key_path":"/k","passphrase":null}"#).unwrap();
        assert!(matches!(auth, AuthMethod::Key { .. }));
    }
}
