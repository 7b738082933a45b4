//! Configuration management for Nectar

mod agent;
mod orchestrator;
pub mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig};
pub use orchestrator::{parse_root_url, OrchestratorConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nectar")
}

/// Get the default orchestrator configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("orchestrator.toml")
}

/// Get the default agent configuration file path
pub fn default_agent_config_path() -> PathBuf {
    default_config_dir().join("agent.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load configuration from a file, falling back to defaults when it doesn't exist
pub fn load_config_or_default<T>(path: &Path) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned + Default,
{
    match load_config(path) {
        Err(ConfigError::NotFound(_)) => {
            tracing::info!("No config at {:?}, using defaults", path);
            Ok(T::default())
        }
        other => other,
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_save_then_load_orchestrator_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("orchestrator.toml");

        let config = OrchestratorConfig {
            bind_address: "127.0.0.1:4000".to_string(),
            handshake_timeout: Duration::from_secs(5),
            master_provisioning: false,
            ..OrchestratorConfig::default()
        };
        save_config(&path, &config).unwrap();

        let loaded: OrchestratorConfig = load_config(&path).unwrap();
        assert_eq!(loaded.bind_address, "127.0.0.1:4000");
        assert_eq!(loaded.handshake_timeout, Duration::from_secs(5));
        assert!(!loaded.master_provisioning);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let result: Result<OrchestratorConfig, _> = load_config(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let config: AgentConfig = load_config_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.orchestrator_address, AgentConfig::default().orchestrator_address);
    }

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "organization = \"acme\"\ngrant = \"abc123\"\n").unwrap();

        let config: AgentConfig = load_config(&path).unwrap();
        assert_eq!(config.organization, "acme");
        assert_eq!(config.grant.as_deref(), Some("abc123"));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "bind_address = [").unwrap();

        let result: Result<OrchestratorConfig, _> = load_config(&path);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
