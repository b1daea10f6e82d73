//! Configuration and data directory resolution.
//!
//! Resolution order: CLI arguments → environment variables → XDG paths → defaults.

use std::path::{Path, PathBuf};

/// Where a path was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly provided via CLI argument.
    CliArgument,

    /// Set via environment variable.
    Environment,

    /// Found in an XDG directory.
    Xdg,

    /// Using built-in defaults.
    #[default]
    BuiltinDefault,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::CliArgument => write!(f, "CLI argument"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::Xdg => write!(f, "XDG directory"),
            ConfigSource::BuiltinDefault => write!(f, "builtin default"),
        }
    }
}

/// A resolved path together with where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPath {
    pub path: Option<PathBuf>,
    pub source: ConfigSource,
}

/// Environment variable names.
pub const ENV_CONFIG_PATH: &str = "TQ_CONFIG";
pub const ENV_CONFIG_DIR: &str = "TQ_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "TQ_DATA_DIR";

/// Standard config file name.
const CONFIG_FILENAME: &str = "config.json";

/// Application name for XDG directories.
const APP_NAME: &str = "telq";

/// Resolve the config file path.
///
/// 1. Explicit CLI path (if it exists)
/// 2. `TQ_CONFIG`
/// 3. `TQ_CONFIG_DIR` + `config.json`
/// 4. XDG config directory (`~/.config/telq/config.json`)
/// 5. Built-in defaults (None)
pub fn resolve_config_path(cli_path: Option<&Path>) -> ResolvedPath {
    if let Some(path) = cli_path {
        if path.exists() {
            return ResolvedPath {
                path: Some(path.to_path_buf()),
                source: ConfigSource::CliArgument,
            };
        }
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return ResolvedPath {
                path: Some(path),
                source: ConfigSource::Environment,
            };
        }
    }

    if let Ok(config_dir) = std::env::var(ENV_CONFIG_DIR) {
        let path = PathBuf::from(config_dir).join(CONFIG_FILENAME);
        if path.exists() {
            return ResolvedPath {
                path: Some(path),
                source: ConfigSource::Environment,
            };
        }
    }

    if let Some(dir) = xdg_config_dir() {
        let path = dir.join(CONFIG_FILENAME);
        if path.exists() {
            return ResolvedPath {
                path: Some(path),
                source: ConfigSource::Xdg,
            };
        }
    }

    ResolvedPath::default()
}

/// Resolve the directory holding the persisted queue.
///
/// CLI path → `TQ_DATA_DIR` → XDG data dir → `./.telq`.
pub fn resolve_data_dir(cli_path: Option<&Path>) -> ResolvedPath {
    if let Some(path) = cli_path {
        return ResolvedPath {
            path: Some(path.to_path_buf()),
            source: ConfigSource::CliArgument,
        };
    }

    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        if !dir.trim().is_empty() {
            return ResolvedPath {
                path: Some(PathBuf::from(dir)),
                source: ConfigSource::Environment,
            };
        }
    }

    if let Some(dir) = dirs::data_local_dir() {
        return ResolvedPath {
            path: Some(dir.join(APP_NAME).join("queue")),
            source: ConfigSource::Xdg,
        };
    }

    ResolvedPath {
        path: Some(PathBuf::from(".telq")),
        source: ConfigSource::BuiltinDefault,
    }
}

/// Get the XDG config directory for telq.
pub fn xdg_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME))
}
