//! Agent configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the master-side agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Orchestrator agent listener address (host:port)
    pub orchestrator_address: String,

    /// Organization this master claims to be
    pub organization: String,

    /// Path to the master's private key
    pub private_key_path: PathBuf,

    /// Provisioning grant delivered out of band, if any
    pub grant: Option<String>,

    /// Extra properties sent in `Hello`
    pub properties: BTreeMap<String, String>,

    /// Expected orchestrator host key fingerprint
    pub orchestrator_host_key: Option<String>,

    /// Connection timeout (covers connect, auth and the approval verdict)
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            orchestrator_address: "localhost:2290".to_string(),
            organization: String::new(),
            private_key_path: super::default_config_dir().join("master_key"),
            grant: None,
            properties: BTreeMap::new(),
            orchestrator_host_key: None,
            connect_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,

    /// Give up after this many attempts (None = retry forever)
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
            max_attempts: None,
        }
    }
}
