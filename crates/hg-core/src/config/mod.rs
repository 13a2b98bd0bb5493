//! Configuration management for hostguard

mod hardening;
pub mod overrides;
pub mod serde_utils;

pub use hardening::{
    EmergencyConfig, FirewallConfig, HardeningConfig, JailConfig, PipelineConfig, PortSpec,
    PrivilegedGroupConfig, Protocol, RootLoginMode, SshConfig, DEFAULT_SSH_PORT,
};
pub use overrides::Override;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/hostguard")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let table = load_table(path)?;
    Ok(toml::Value::Table(table).try_into()?)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    Ok(toml::from_str(&content)?)
}

impl HardeningConfig {
    /// Build the run's configuration once.
    ///
    /// An explicit `path` must exist; without one the default path is used
    /// when present and built-in defaults otherwise. Overrides are applied
    /// in order on top of the file, then the result is validated.
    pub fn load(path: Option<&Path>, overrides: &[Override]) -> Result<Self, ConfigError> {
        let mut table = match path {
            Some(path) => load_table(path)?,
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    load_table(&default_path)?
                } else {
                    tracing::info!("No config at {:?}, using defaults", default_path);
                    toml::Table::new()
                }
            }
        };

        overrides::apply(&mut table, overrides)?;

        let config: HardeningConfig = toml::Value::Table(table).try_into()?;
        config.validate()?;
        Ok(config)
    }
}
