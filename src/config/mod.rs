//! Configuration Module
//!
//! Agent settings loaded from a JSON file: grid credentials, ports, relay
//! filtering, timeouts and the reconnect budget.

pub mod storage;
pub mod types;

pub use storage::{config_dir, default_config_file, ConfigError, ConfigStorage};
pub use types::{AgentConfig, UpstreamProxyConfig, CONFIG_VERSION, HUB_PORTS};
