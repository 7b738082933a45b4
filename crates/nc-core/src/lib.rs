//! nc-core: Core types and configuration for Nectar
//!
//! Shared by the orchestrator and the agent: the organization name type,
//! configuration structures, and their error types.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use error::{ConfigError, InvalidOrganization};
pub use types::Organization;
