//! Configuration module for dagserve
//!
//! This module handles engine configuration including:
//! - Scheduler timeouts and limits (`[scheduler]`)
//! - Log filter and optional log directory (`[logging]`)
//! - JSON pipeline definition files (`pipeline_config_list`)
//!
//! # Config Location
//!
//! The engine config is a TOML file. Unless `DAGSERVE_CONFIG` points
//! elsewhere it is looked up in the platform config directory:
//! - **Linux**: `~/.config/dev.dagserve/dagserve.toml`
//! - **macOS**: `~/Library/Application Support/dev.dagserve/dagserve.toml`
//! - **Windows**: `%APPDATA%\dev.dagserve\dagserve.toml`
//!
//! # Example
//!
//! ```ignore
//! use dagserve::config::{EngineConfig, PipelineConfigFile};
//!
//! let config = EngineConfig::load_or_default(EngineConfig::default_path());
//! let file = PipelineConfigFile::load("pipelines.json")?;
//! let definitions = file.definitions(&config.scheduler)?;
//! ```

pub mod pipeline_file;
pub mod settings;

pub use pipeline_file::{
    NodeConfig, NodeType, OutputAlias, PipelineConfig, PipelineConfigFile, SourceNode,
};
pub use settings::*;

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application identifier for config directories
pub const APP_ID: &str = "dev.dagserve";

/// Engine config filename
pub const CONFIG_FILE: &str = "dagserve.toml";

/// Environment variable overriding the config path
pub const CONFIG_ENV_VAR: &str = "DAGSERVE_CONFIG";

/// Get the platform config directory of the engine
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerSettings,
    pub logging: LoggingSettings,
}

impl EngineConfig {
    /// Config path from `DAGSERVE_CONFIG`, else the platform config dir
    pub fn default_path() -> Option<PathBuf> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
            _ => config_dir().map(|p| p.join(CONFIG_FILE)),
        }
    }

    /// Load config from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            EngineError::Config(format!("Failed to parse config file {:?}: {}", path, e))
        })
    }

    /// Load config, returning defaults on any error
    pub fn load_or_default(path: Option<impl AsRef<Path>>) -> Self {
        let Some(path) = path else {
            tracing::warn!("Could not determine config path, using defaults");
            return Self::default();
        };
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save config to a TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Serialization(format!("engine config: {}", e)))?;

        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }
}
