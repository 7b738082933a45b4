//! Externally reachable URLs
//!
//! The root URL is resolved once when the orchestrator starts and can be
//! overridden afterwards. Masters locate the agent listener through the
//! endpoint derived from it.

use std::sync::RwLock;

use url::Url;

use nc_core::config::parse_root_url;
use nc_core::ConfigError;

/// Path, relative to the root URL, of the agent endpoint
const AGENT_ENDPOINT_PATH: &str = "agent-port/";

/// The orchestrator's published base URL
#[derive(Debug)]
pub struct RootUrl {
    url: RwLock<Url>,
}

impl RootUrl {
    pub fn new(url: Url) -> Self {
        Self {
            url: RwLock::new(url),
        }
    }

    pub fn get(&self) -> Url {
        match self.url.read() {
            Ok(url) => url.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the root URL. The value is normalised to end with `/`.
    pub fn set(&self, raw: &str) -> Result<Url, ConfigError> {
        let url = parse_root_url(raw)?;
        let mut current = match self.url.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = url.clone();
        tracing::info!("Root URL set to {}", url);
        Ok(url)
    }

    /// URL masters use to locate the agent listener
    pub fn agent_endpoint_url(&self) -> Result<Url, ConfigError> {
        let root = self.get();
        root.join(AGENT_ENDPOINT_PATH)
            .map_err(|source| ConfigError::Url {
                url: root.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_endpoint_is_under_root() {
        let root = RootUrl::new(parse_root_url("https://ops.example.com/nectar").unwrap());
        assert_eq!(
            root.agent_endpoint_url().unwrap().as_str(),
            "https://ops.example.com/nectar/agent-port/"
        );
    }

    #[test]
    fn test_override() {
        let root = RootUrl::new(parse_root_url("http://localhost:8080/").unwrap());

        root.set("https://nectar.example.com").unwrap();
        assert_eq!(root.get().as_str(), "https://nectar.example.com/");
        assert_eq!(
            root.agent_endpoint_url().unwrap().as_str(),
            "https://nectar.example.com/agent-port/"
        );

        assert!(root.set("not a url").is_err());
        assert_eq!(root.get().as_str(), "https://nectar.example.com/");
    }
}
