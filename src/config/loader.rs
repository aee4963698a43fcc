//! Config file loader and serialization.

use super::ManagerConfig;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = "kextkit";
const CONFIG_FILE_NAME: &str = "config.json";

/// Get the global config path: <config dir>/kextkit/config.json
pub fn get_global_config_path() -> Result<PathBuf, ConfigError> {
    let config_dir = dirs::config_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine config directory".to_string())
    })?;
    Ok(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Load config from a JSON or TOML file, chosen by extension.
pub fn load_config_from_file(path: &Path) -> Result<ManagerConfig, ConfigError> {
    // Validate the path first
    validate_config_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!(
                "Configuration file not found at: {}",
                path.display()
            ))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let config: ManagerConfig = if is_toml(path) {
        toml::from_str(&content).map_err(|e| ConfigError::InvalidToml(e.to_string()))?
    } else {
        serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?
    };
    config.validate()?;

    Ok(config)
}

/// Save config to a JSON or TOML file, chosen by extension.
pub fn save_config_to_file(config: &ManagerConfig, path: &Path) -> Result<(), ConfigError> {
    validate_config_path(path)?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(ConfigError::IoError)?;
        }
    }

    let content = if is_toml(path) {
        toml::to_string_pretty(config).map_err(|e| ConfigError::InvalidToml(e.to_string()))?
    } else {
        serde_json::to_string_pretty(config).map_err(ConfigError::InvalidJson)?
    };
    fs::write(path, content).map_err(ConfigError::IoError)?;

    Ok(())
}

/// Load the global config, or defaults if there is none.
pub fn load_global_config() -> Result<ManagerConfig, ConfigError> {
    let path = get_global_config_path()?;
    match load_config_from_file(&path) {
        Err(ConfigError::FileNotFound(_)) => Ok(ManagerConfig::default()),
        other => other,
    }
}

/// Validate config path (.json or .toml extension required).
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "json" || ext == "toml" => {}
        Some(ext) => {
            return Err(ConfigError::ValidationFailed(format!(
                "Configuration file must have .json or .toml extension, got .{}",
                ext.to_string_lossy()
            )))
        }
        None => {
            return Err(ConfigError::ValidationFailed(
                "Configuration file must have .json or .toml extension".to_string(),
            ))
        }
    }

    if path.to_str().is_none() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

fn is_toml(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "toml")
}
