//! nc-agent: master-side peer of the Nectar agent protocol
//!
//! Runs next to a master and keeps it linked to the orchestrator: it
//! authenticates with the master's key under its organization name,
//! presents the provisioning grant on first contact, and reconnects with
//! backoff when the link drops or the orchestrator asks it to come back later.

pub mod keys;
pub mod link;

pub use link::{ActiveLink, AgentConnector, ConnectError, ExponentialBackoff, LinkEvent};
