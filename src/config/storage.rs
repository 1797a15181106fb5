//! Configuration Storage
//!
//! Reads and writes the agent config file.
//! Config location: ~/.oxidetunnel on macOS/Linux, %APPDATA%\OxideTunnel on Windows

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{AgentConfig, CONFIG_VERSION};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Get the OxideTunnel configuration directory
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTunnel"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxidetunnel"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxidetunnel"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Default config file path
pub fn default_config_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a storage manager with the default path
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: default_config_file()?,
        })
    }

    /// Create storage manager with custom path
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get config file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and validate the configuration
    ///
    /// Unlike UI settings there is no usable default here: the grid
    /// credentials must come from the file, so a missing file is an error.
    pub async fn load(&self) -> Result<AgentConfig, ConfigError> {
        let contents = fs::read_to_string(&self.path).await?;
        let config: AgentConfig = serde_json::from_str(&contents)?;

        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        config.validate()?;
        tracing::debug!("Loaded config from {}", self.path.display());
        Ok(config)
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }
}
