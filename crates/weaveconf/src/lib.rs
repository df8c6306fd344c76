//! Layered configuration loading for weave.
//!
//! Every domain reads its settings from one [`WeaveConfig`]. The crate keeps
//! its dependencies small so any weave crate can import it.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins, tables merge key by key):
//! 1. `/etc/weave/config.toml` (system)
//! 2. `~/.config/weave/config.toml` (user)
//! 3. `./weave.toml` (local override) or an explicit path
//! 4. Environment variables (`WEAVE_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [audio]
//! sample_rate = 48000
//! block_size = 128
//! device = "USB"
//!
//! [graphics]
//! fps = 30
//!
//! [osc]
//! port = 9010
//! bind_address = "0.0.0.0"
//!
//! [state]
//! port = 10100
//! destinations = ["192.168.1.20:10100", "192.168.1.21:10100"]
//!
//! [telemetry]
//! log_level = "debug"
//! ```

pub mod loader;
pub mod sections;

pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use sections::{AudioSection, GraphicsSection, OscSection, StateSection, TelemetrySection};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete weave configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WeaveConfig {
    pub audio: AudioSection,
    pub graphics: GraphicsSection,
    pub osc: OscSection,
    pub state: StateSection,
    pub telemetry: TelemetrySection,
}

impl WeaveConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace the local
    /// `./weave.toml` override. System and user files still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report where the values came from.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        let (mut config, mut sources) = loader::load_files(&files)?;
        loader::apply_env_overrides(&mut config, &mut sources, |key| std::env::var(key).ok());
        Ok((config, sources))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string(self).unwrap_or_else(|e| format!("# render failed: {e}\n"));
        format!("# weave configuration\n\n{body}")
    }
}
