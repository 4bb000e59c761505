//! Bootstrap configuration loading
//!
//! Configuration file resolution follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. User config file (`<config_dir>/cadenza/config.toml`)
//! 4. System config file (`/etc/cadenza/config.toml`, Linux only)
//!
//! A missing file is not an error: callers fall back to built-in defaults
//! and a warning is logged.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable naming the configuration file
pub const CONFIG_ENV_VAR: &str = "CADENZA_CONFIG";

/// Logging configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the configuration file path
///
/// Returns `None` when no candidate exists; an explicit CLI path or
/// environment value is returned even if the file is missing so that the
/// caller can report it.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config file
    if let Some(path) = dirs::config_dir().map(|d| d.join("cadenza").join("config.toml")) {
        if path.exists() {
            return Some(path);
        }
    }

    // Priority 4: System config file
    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/cadenza/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Parse a TOML document into `T`
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    Ok(toml::from_str(content)?)
}

/// Load `T` from a TOML file, falling back to `T::default()` when the file
/// is missing
///
/// A file that exists but fails to parse is an error: silently ignoring a
/// typo would run the engine with settings the user did not ask for.
pub fn load_toml_or_default<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        info!("No configuration file found, using built-in defaults");
        return Ok(T::default());
    };

    match std::fs::read_to_string(path) {
        Ok(content) => {
            info!("Loading configuration from {}", path.display());
            parse_toml(&content).map_err(|e| {
                Error::Config(format!("Failed to parse {}: {}", path.display(), e))
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Configuration file {} not found, using built-in defaults",
                path.display()
            );
            Ok(T::default())
        }
        Err(e) => Err(Error::Io(e)),
    }
}
