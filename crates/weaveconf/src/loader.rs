//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, WeaveConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// A leading `~/` or `$VAR/` in `cli_path` is expanded first.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/weave/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("weave/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        let path = expand_path(&path.to_string_lossy());
        if path.exists() {
            files.push(path);
            return files;
        }
    }

    let local = PathBuf::from("weave.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load and merge the given files in order on top of compiled defaults.
pub fn load_files(files: &[PathBuf]) -> Result<(WeaveConfig, ConfigSources), ConfigError> {
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();

    for path in files {
        let table = read_table(path)?;
        merge_tables(&mut merged, table);
        sources.files.push(path.clone());
    }

    let config: WeaveConfig = toml::Value::Table(merged)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: files.last().cloned().unwrap_or_default(),
            message: e.to_string(),
        })?;

    Ok((config, sources))
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deep-merge `overlay` into `base`. Nested tables merge key by key, every
/// other value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
///
/// `lookup` is `std::env::var` in production; tests pass a map.
pub fn apply_env_overrides<F>(config: &mut WeaveConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut record = |key: &str| sources.env_overrides.push(key.to_string());

    if let Some(rate) = lookup("WEAVE_SAMPLE_RATE").and_then(|v| v.parse().ok()) {
        config.audio.sample_rate = rate;
        record("WEAVE_SAMPLE_RATE");
    }
    if let Some(size) = lookup("WEAVE_BLOCK_SIZE").and_then(|v| v.parse().ok()) {
        config.audio.block_size = size;
        record("WEAVE_BLOCK_SIZE");
    }
    if let Some(device) = lookup("WEAVE_AUDIO_DEVICE") {
        config.audio.device = device;
        record("WEAVE_AUDIO_DEVICE");
    }

    if let Some(port) = lookup("WEAVE_OSC_PORT").and_then(|v| v.parse().ok()) {
        config.osc.port = port;
        record("WEAVE_OSC_PORT");
    }
    if let Some(bind) = lookup("WEAVE_OSC_BIND") {
        config.osc.bind_address = bind;
        record("WEAVE_OSC_BIND");
    }

    if let Some(fps) = lookup("WEAVE_FPS").and_then(|v| v.parse().ok()) {
        config.graphics.fps = fps;
        record("WEAVE_FPS");
    }

    if let Some(port) = lookup("WEAVE_STATE_PORT").and_then(|v| v.parse().ok()) {
        config.state.port = port;
        record("WEAVE_STATE_PORT");
    }

    if let Some(level) = lookup("WEAVE_LOG_LEVEL") {
        config.telemetry.log_level = level;
        record("WEAVE_LOG_LEVEL");
    }
    // RUST_LOG wins over the weave-specific variable
    if let Some(level) = lookup("RUST_LOG") {
        config.telemetry.log_level = level;
        record("RUST_LOG");
    }
}

/// Expand `~/` and a leading `$VAR/` in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        return directories::BaseDirs::new()
            .map(|d| d.home_dir().join(stripped))
            .unwrap_or_else(|| PathBuf::from(path));
    }

    if let Some(stripped) = path.strip_prefix('$') {
        let (var_name, rest) = match stripped.find('/') {
            Some(slash) => (&stripped[..slash], Some(&stripped[slash + 1..])),
            None => (stripped, None),
        };
        return match (env::var(var_name), rest) {
            (Ok(value), Some(rest)) => PathBuf::from(value).join(rest),
            (Ok(value), None) => PathBuf::from(value),
            (Err(_), _) => PathBuf::from(path),
        };
    }

    PathBuf::from(path)
}
