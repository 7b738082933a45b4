//! Core error types for Nectar

use std::path::PathBuf;
use thiserror::Error;

/// An organization name that violates the safe-name policy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidOrganization {
    /// Empty or whitespace-only
    #[error("Organization name must not be empty")]
    Empty,

    /// Longer than the allowed maximum
    #[error("Organization name is longer than {max} characters")]
    TooLong { max: usize },

    /// `.` or `..`
    #[error("\"{0}\" is not an allowed organization name")]
    Reserved(String),

    /// Contains a character outside the policy
    #[error("'{ch}' is an unsafe character in organization name \"{name}\"")]
    UnsafeCharacter { name: String, ch: char },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// URL could not be parsed
    #[error("Invalid URL {url}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}
