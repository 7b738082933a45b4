//! Link management for connecting a master to the orchestrator

mod backoff;
mod connector;

pub use backoff::ExponentialBackoff;
pub use connector::{ActiveLink, AgentConnector, ConnectError, LinkEvent};
