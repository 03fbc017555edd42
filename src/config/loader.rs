//! Config document loading
//!
//! Path resolution precedence: explicit argument > `CONFIG_PATH` env >
//! `./config.json` > `~/.bungee/config.json`.

use std::path::{Path, PathBuf};

use super::validation::{validate, ConfigError};
use super::Config;

/// Resolve the config document path.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }

    if let Ok(env_path) = std::env::var("CONFIG_PATH") {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    let cwd_config = PathBuf::from("config.json");
    if cwd_config.exists() {
        return cwd_config;
    }

    home_config().unwrap_or(cwd_config)
}

fn home_config() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".bungee").join("config.json"))
}

/// Load and validate the config document at `path`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_config(&raw, path)
}

/// Parse and validate a config document from raw text. `path` is only used
/// in error messages.
pub fn parse_config(raw: &str, path: &Path) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;

    validate(&config)?;
    Ok(config)
}
