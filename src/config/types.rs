//! Agent configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::storage::ConfigError;

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Hub ports accepted by the grid's tunnel endpoint
pub const HUB_PORTS: [u16; 2] = [80, 4446];

/// Agent configuration
///
/// Everything here has a default except the grid credentials, so a minimal
/// config file is just `{"api_key": "...", "api_secret": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Config file version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Grid API key (doubles as the SSH username)
    pub api_key: String,

    /// Grid API secret (doubles as the SSH password)
    pub api_secret: String,

    /// Fixed tunnel server, for grids without a tunnel-provisioning API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_host: Option<String>,

    /// SSH port on the tunnel server
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Optional SHA-256 host key pin, e.g. `SHA256:abc...`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,

    /// Local port of the CONNECT / WebSocket relay proxy
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Local port that exposes the grid hub (local-bind forward)
    #[serde(default = "default_se_port")]
    pub se_port: u16,

    /// Hub port on the tunnel server: 80 or 4446
    #[serde(default = "default_hub_port")]
    pub hub_port: u16,

    /// Port the tunnel server binds for us (remote-bind forward to `proxy_port`)
    #[serde(default = "default_remote_proxy_port")]
    pub remote_proxy_port: u16,

    /// Destinations that fail immediately (`host:port`)
    #[serde(default)]
    pub fast_fail_domains: Vec<String>,

    /// Strict allow-list (`host:port`); empty allows everything not denied
    #[serde(default)]
    pub allowed_destinations: Vec<String>,

    /// Corporate proxy the outbound relay leg must transit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_proxy: Option<UpstreamProxyConfig>,

    /// Relay connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Relay idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// SSH handshake timeout in seconds
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout_secs: u64,

    /// Keepalive heartbeat interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Liveness check interval in seconds
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,

    /// Fixed delay between reconnect attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Reconnect attempts before requesting a brand-new tunnel
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Verbose logging
    #[serde(default)]
    pub debug: bool,
}

/// Upstream (corporate) HTTP proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamProxyConfig {
    pub host: String,
    #[serde(default = "default_upstream_proxy_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_ssh_port() -> u16 {
    22
}

fn default_proxy_port() -> u16 {
    8087
}

fn default_se_port() -> u16 {
    4445
}

fn default_hub_port() -> u16 {
    80
}

fn default_remote_proxy_port() -> u16 {
    2010
}

fn default_upstream_proxy_port() -> u16 {
    3128
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_ssh_timeout() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    15
}

fn default_liveness_interval() -> u64 {
    5
}

fn default_retry_delay() -> u64 {
    5
}

fn default_max_retry_attempts() -> u32 {
    30
}

fn default_buffer_size() -> usize {
    32 * 1024
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            api_key: String::new(),
            api_secret: String::new(),
            tunnel_host: None,
            ssh_port: default_ssh_port(),
            host_key_fingerprint: None,
            proxy_port: default_proxy_port(),
            se_port: default_se_port(),
            hub_port: default_hub_port(),
            remote_proxy_port: default_remote_proxy_port(),
            fast_fail_domains: Vec::new(),
            allowed_destinations: Vec::new(),
            upstream_proxy: None,
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            ssh_timeout_secs: default_ssh_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            liveness_interval_secs: default_liveness_interval(),
            retry_delay_secs: default_retry_delay(),
            max_retry_attempts: default_max_retry_attempts(),
            buffer_size: default_buffer_size(),
            debug: false,
        }
    }
}

impl AgentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }

    /// Check the config for values the agent cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "api_key and api_secret are required".into(),
            ));
        }
        if !HUB_PORTS.contains(&self.hub_port) {
            return Err(ConfigError::Invalid(format!(
                "hub_port must be one of {:?}, got {}",
                HUB_PORTS, self.hub_port
            )));
        }
        if self.proxy_port == self.se_port {
            return Err(ConfigError::Invalid(format!(
                "proxy_port and se_port must differ (both {})",
                self.proxy_port
            )));
        }
        for entry in self
            .fast_fail_domains
            .iter()
            .chain(self.allowed_destinations.iter())
        {
            if crate::relay::filter::split_destination(entry).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "destination '{}' must be host:port",
                    entry
                )));
            }
        }
        for (name, secs) in [
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("liveness_interval_secs", self.liveness_interval_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }
        if self.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_retry_attempts must be at least 1".into(),
            ));
        }
        if self.buffer_size < 1024 {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} is below the 1024 byte minimum",
                self.buffer_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AgentConfig {
        AgentConfig {
            api_key: "key".into(),
            api_secret: "secret".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_json_gets_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"api_key":"k","api_secret":"s"}"#).unwrap();
        assert_eq!(config.hub_port, 80);
        assert_eq!(config.proxy_port, 8087);
        assert_eq!(config.max_retry_attempts, 30);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert!(config.upstream_proxy.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_timers() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"api_key":"k","api_secret":"s","heartbeat_interval_secs":0}"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("heartbeat")));

        for config in [
            AgentConfig { connect_timeout_secs: 0, ..valid() },
            AgentConfig { idle_timeout_secs: 0, ..valid() },
            AgentConfig { liveness_interval_secs: 0, ..valid() },
        ] {
            assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_rejects_unknown_hub_port() {
        let config = AgentConfig {
            hub_port: 8080,
            ..valid()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_portless_fast_fail_entry() {
        let config = AgentConfig {
            fast_fail_domains: vec!["ads.example.com".into()],
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            fast_fail_domains: vec!["ads.example.com:80".into()],
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_requires_credentials() {
        assert!(AgentConfig::default().validate().is_err());
    }
}
