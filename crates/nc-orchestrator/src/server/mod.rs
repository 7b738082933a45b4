//! Agent protocol server

mod handler;
mod listener;

pub use handler::MasterEvent;
pub(crate) use handler::ListenerContext;
pub use listener::{ssh_config, AgentListener, ListenerError};
