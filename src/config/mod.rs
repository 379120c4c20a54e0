//! Agent configuration
//!
//! Defaults for sync requests plus a couple of process-level switches,
//! loadable from a TOML file under the platform config directory. The config
//! is passed to the agent at construction; there is no ambient global.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::error::{AgentError, Result};

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Minimum number of message headers fetched per folder listing.
    #[serde(default = "default_sync_minimum")]
    pub sync_minimum: u32,

    /// Whether whole-account syncs walk every folder or only the inbox.
    #[serde(default = "default_true")]
    pub sync_only_inbox: bool,

    /// Set for headless operation; completed runs log a summary instead of
    /// relying on an attached UI.
    #[serde(default)]
    pub background_process: bool,

    /// Maximum number of results requested from a server-side search.
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,
}

fn default_sync_minimum() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

fn default_search_limit() -> u32 {
    100
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sync_minimum: default_sync_minimum(),
            sync_only_inbox: default_true(),
            background_process: false,
            search_limit: default_search_limit(),
        }
    }
}

impl AgentConfig {
    /// Load the configuration from the default location, falling back to
    /// defaults when no file exists yet.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            info!("no config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load the configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        info!("loaded config from {:?}", path);
        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| AgentError::Config("no config directory on this platform".to_string()))?;
        Ok(dir.join("dory").join("config.toml"))
    }
}
