//! nc-orchestrator: control plane for a fleet of masters
//!
//! Masters connect inbound over SSH, authenticating with their own key and
//! claiming an organization. The orchestrator decides whether to trust each
//! connection (first-contact grant, known identity, or refusal), keeps every
//! master's trust state in its registry entry, and holds the live channel of
//! each connected master.

pub mod approval;
pub mod endpoint;
pub mod grant;
pub mod identity;
pub mod orchestrator;
pub mod provisioning;
pub mod registry;
pub mod server;

pub use approval::{AgentApprover, Approval, ApprovalError, HandshakeRequest};
pub use grant::{Grant, GrantIssuer};
pub use identity::{load_or_generate_host_key, MasterIdentity};
pub use orchestrator::{AdministrativeAlert, Orchestrator, OrchestratorError, LISTENER_BIND_ALERT};
pub use provisioning::{MasterProvisioner, ProvisionRequest};
pub use registry::{MasterRegistry, MasterServer, MasterSnapshot, MasterState};
pub use server::MasterEvent;
