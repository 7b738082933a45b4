//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the orchestrator daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address the agent listener binds to
    pub bind_address: String,

    /// Name presented to masters in the `Accepted` verdict
    pub display_name: String,

    /// Externally reachable base URL. When unset it is derived from
    /// `public_host` and `web_port`.
    pub root_url: Option<String>,

    /// Host name used to derive the root URL
    pub public_host: String,

    /// Port used to derive the root URL
    pub web_port: u16,

    /// Path to the orchestrator's long-lived host key
    pub host_key_path: PathBuf,

    /// How long a peer has to complete key exchange, authentication and `Hello`
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Idle time after which an approved connection is dropped
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,

    /// How long shutdown waits for in-flight connections
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Whether masters may be provisioned (as opposed to only attached)
    pub master_provisioning: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2290".to_string(),
            display_name: "Nectar".to_string(),
            root_url: None,
            public_host: "localhost".to_string(),
            web_port: 8080,
            host_key_path: super::default_config_dir().join("host_key"),
            handshake_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(5),
            master_provisioning: true,
        }
    }
}

impl OrchestratorConfig {
    /// Resolve the externally reachable root URL.
    ///
    /// An explicit `root_url` wins; otherwise `http://{public_host}:{web_port}/`.
    /// The result always ends with `/` so relative joins append to it.
    pub fn resolve_root_url(&self) -> Result<Url, ConfigError> {
        let raw = match &self.root_url {
            Some(url) => url.clone(),
            None => format!("http://{}:{}/", self.public_host, self.web_port),
        };
        parse_root_url(&raw)
    }
}

/// Parse a base URL, normalising it to end with a slash
pub fn parse_root_url(raw: &str) -> Result<Url, ConfigError> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }

    let url = Url::parse(&raw).map_err(|source| ConfigError::Url {
        url: raw.clone(),
        source,
    })?;

    if url.cannot_be_a_base() {
        return Err(ConfigError::Invalid(format!(
            "Root URL {} cannot be used as a base",
            raw
        )));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_url_derived_from_host() {
        let config = OrchestratorConfig {
            public_host: "nectar.example.com".to_string(),
            web_port: 9090,
            ..OrchestratorConfig::default()
        };
        assert_eq!(
            config.resolve_root_url().unwrap().as_str(),
            "http://nectar.example.com:9090/"
        );
    }

    #[test]
    fn test_root_url_override_gets_trailing_slash() {
        let config = OrchestratorConfig {
            root_url: Some("https://ops.example.com/nectar".to_string()),
            ..OrchestratorConfig::default()
        };
        assert_eq!(
            config.resolve_root_url().unwrap().as_str(),
            "https://ops.example.com/nectar/"
        );
    }

    #[test]
    fn test_root_url_rejects_garbage() {
        assert!(parse_root_url("not a url").is_err());
        assert!(parse_root_url("mailto:ops@example.com").is_err());
    }
}
