//! Approval decisions for inbound master connections
//!
//! The listener calls into [`AgentApprover`] at three points of a
//! connection's life:
//!
//! - `on_connecting`, once, when the master's `Hello` arrives. This looks up
//!   the entry for the claimed organization and, under the entry lock, decides
//!   between first-contact approval (grant), reapproval (known identity) and
//!   refusal.
//! - `on_connected`, after a successful decision, to bind the live channel.
//! - `on_disconnected`, when the connection ends, to unbind it again.
//!
//! # Refusals
//!
//! Every refusal carries a [`RefusalKind`] that the master sees on the wire:
//!
//! | Error | Kind | Entry |
//! |---|---|---|
//! | `UnknownMaster` | protocol | untouched |
//! | `NotApprovable` | graceful | untouched |
//! | `NotApproved` | graceful | `ApprovalError` |
//! | `InvalidGrant` | security | `ApprovalError` |
//! | `IdentityInUse` | security | `ApprovalError` |
//! | `IdentityMismatch` | security | unchanged, error recorded |
//! | `Inconsistent` | internal | unchanged, error recorded |

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use nc_core::Organization;
use nc_protocol::{Message, Properties, RefusalKind, PROPERTY_GRANT};

use crate::endpoint::RootUrl;
use crate::grant::GrantIssuer;
use crate::identity::MasterIdentity;
use crate::registry::{ConnectionId, MasterChannel, MasterRegistry, MasterState};

/// What an authenticated peer presented
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    /// Organization claimed through the SSH user name
    pub organization: Organization,
    /// Key the peer proved possession of
    pub identity: MasterIdentity,
    /// Properties from the peer's `Hello`
    pub properties: Properties,
    /// Remote address of the connection
    pub address: SocketAddr,
}

impl HandshakeRequest {
    /// The grant property, if one was supplied and is not blank
    pub fn grant(&self) -> Option<&str> {
        self.properties
            .get(PROPERTY_GRANT)
            .map(|g| g.trim())
            .filter(|g| !g.is_empty())
    }
}

/// A successful decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    /// First contact, approved through the grant
    Approved,
    /// The bound identity came back
    Reapproved,
}

/// Why a connection was refused
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("No master named {0} is known")]
    UnknownMaster(Organization),

    #[error("Master {organization} cannot be approved while in state {state}")]
    NotApprovable {
        organization: Organization,
        state: MasterState,
    },

    #[error("Master {0} is not approved")]
    NotApproved(Organization),

    #[error("Invalid grant presented for master {0}")]
    InvalidGrant(Organization),

    #[error("Key {fingerprint} is already bound to master {owner}")]
    IdentityInUse {
        fingerprint: String,
        owner: Organization,
    },

    #[error("Key {presented} does not match the identity bound to master {organization}")]
    IdentityMismatch {
        organization: Organization,
        presented: String,
    },

    #[error("Master {organization} is in an inconsistent state: {detail}")]
    Inconsistent {
        organization: Organization,
        detail: String,
    },
}

impl ApprovalError {
    /// How the refusal is reported to the peer
    pub fn kind(&self) -> RefusalKind {
        match self {
            ApprovalError::UnknownMaster(_) => RefusalKind::Protocol,
            ApprovalError::NotApprovable { .. } | ApprovalError::NotApproved(_) => {
                RefusalKind::Graceful
            }
            ApprovalError::InvalidGrant(_)
            | ApprovalError::IdentityInUse { .. }
            | ApprovalError::IdentityMismatch { .. } => RefusalKind::Security,
            ApprovalError::Inconsistent { .. } => RefusalKind::Internal,
        }
    }

    /// The `Refused` verdict for this error
    pub fn to_message(&self) -> Message {
        Message::refused(self.kind(), self.to_string())
    }
}

/// Decision logic invoked by the agent listener
pub struct AgentApprover {
    registry: Arc<MasterRegistry>,
    grants: Arc<GrantIssuer>,
    display_name: String,
    root_url: Arc<RootUrl>,
}

impl AgentApprover {
    pub fn new(
        registry: Arc<MasterRegistry>,
        grants: Arc<GrantIssuer>,
        display_name: impl Into<String>,
        root_url: Arc<RootUrl>,
    ) -> Self {
        Self {
            registry,
            grants,
            display_name: display_name.into(),
            root_url,
        }
    }

    /// Decide whether the peer may connect as `request.organization`
    pub async fn on_connecting(
        &self,
        request: &HandshakeRequest,
    ) -> Result<Approval, ApprovalError> {
        let organization = &request.organization;

        let Some(master) = self.registry.get_by_organization(organization) else {
            tracing::warn!(
                "Refusing {} from {}: unknown master",
                organization,
                request.address
            );
            return Err(ApprovalError::UnknownMaster(organization.clone()));
        };

        let mut guard = master.lock().await;
        let state = guard.state();

        if !state.is_approvable() {
            tracing::warn!(
                "Refusing {} from {}: master is in state {}",
                organization,
                request.address,
                state
            );
            return Err(ApprovalError::NotApprovable {
                organization: organization.clone(),
                state,
            });
        }

        if state.is_approved() {
            if guard.identity() != Some(&request.identity) {
                let err = ApprovalError::IdentityMismatch {
                    organization: organization.clone(),
                    presented: request.identity.fingerprint().to_string(),
                };
                tracing::error!(
                    "SECURITY: master {} presented key {} from {}, expected {}",
                    organization,
                    request.identity,
                    request.address,
                    guard.identity().map(|i| i.fingerprint()).unwrap_or("none")
                );
                guard.record_error(err.kind(), err.to_string());
                return Err(err);
            }

            let superseded = guard
                .set_reapproved_state()
                .map_err(|e| inconsistent(organization, e))?;
            if let Some(channel) = superseded {
                tracing::info!(
                    "Master {} reconnected from {}, closing previous connection {}",
                    organization,
                    request.address,
                    channel.id()
                );
                channel.close();
            }

            tracing::info!("Master {} reapproved from {}", organization, request.address);
            return Ok(Approval::Reapproved);
        }

        // Created or Provisioning: only a grant can approve first contact
        let Some(presented) = request.grant() else {
            let err = ApprovalError::NotApproved(organization.clone());
            tracing::warn!(
                "Refusing {} from {}: not approved and no grant supplied",
                organization,
                request.address
            );
            guard.set_approval_error_state(err.kind(), err.to_string());
            return Err(err);
        };

        if !self.grants.matches(&guard, Some(presented)) {
            let err = ApprovalError::InvalidGrant(organization.clone());
            tracing::error!(
                "SECURITY: invalid grant for master {} from {} (key {})",
                organization,
                request.address,
                request.identity
            );
            guard.set_approval_error_state(err.kind(), err.to_string());
            return Err(err);
        }

        let _binding = self.registry.lock_identity_binding().await;
        if let Some(owner) = self.registry.get_by_identity(&request.identity) {
            let err = ApprovalError::IdentityInUse {
                fingerprint: request.identity.fingerprint().to_string(),
                owner: owner.organization().clone(),
            };
            tracing::error!(
                "SECURITY: master {} presented key {} already bound to {}",
                organization,
                request.identity,
                owner.organization()
            );
            guard.set_approval_error_state(err.kind(), err.to_string());
            return Err(err);
        }

        guard
            .set_approved_state(request.identity.clone(), request.address)
            .map_err(|e| inconsistent(organization, e))?;

        tracing::info!(
            "Master {} approved from {} with key {}",
            organization,
            request.address,
            request.identity
        );
        Ok(Approval::Approved)
    }

    /// Bind the channel of a connection that `on_connecting` approved.
    ///
    /// Any failure here means the registry changed underneath the
    /// connection; the channel is closed.
    pub async fn on_connected(
        &self,
        organization: &Organization,
        identity: &MasterIdentity,
        channel: MasterChannel,
    ) -> Result<(), ApprovalError> {
        let Some(master) = self.registry.get_by_organization(organization) else {
            tracing::error!(
                "INTERNAL: connection {} approved for {} but the master no longer exists",
                channel.id(),
                organization
            );
            channel.close();
            return Err(ApprovalError::Inconsistent {
                organization: organization.clone(),
                detail: "master not found when binding channel".to_string(),
            });
        };

        let mut guard = master.lock().await;

        if guard.identity() != Some(identity) {
            let err = ApprovalError::Inconsistent {
                organization: organization.clone(),
                detail: format!("identity changed before channel {} was bound", channel.id()),
            };
            tracing::error!("INTERNAL: {}", err);
            guard.record_error(err.kind(), err.to_string());
            channel.close();
            return Err(err);
        }

        match guard.set_connected_state(channel.clone()) {
            Ok(previous) => {
                if let Some(previous) = previous {
                    tracing::info!(
                        "Master {}: connection {} replaces {}",
                        organization,
                        channel.id(),
                        previous.id()
                    );
                    previous.close();
                }
                tracing::info!(
                    "Master {} connected from {} (connection {})",
                    organization,
                    channel.remote_addr(),
                    channel.id()
                );
                Ok(())
            }
            Err(e) => {
                let err = inconsistent(organization, e);
                tracing::error!("INTERNAL: {}", err);
                guard.record_error(err.kind(), err.to_string());
                channel.close();
                Err(err)
            }
        }
    }

    /// Unbind the channel of `connection_id`, if it is the one bound
    pub async fn on_disconnected(&self, organization: &Organization, connection_id: ConnectionId) {
        let Some(master) = self.registry.get_by_organization(organization) else {
            tracing::debug!(
                "Connection {} closed for {}, which is no longer registered",
                connection_id,
                organization
            );
            return;
        };

        let mut guard = master.lock().await;
        if guard.set_disconnected_state(connection_id) {
            tracing::info!(
                "Master {} disconnected (connection {}), now {}",
                organization,
                connection_id,
                guard.state()
            );
        } else {
            tracing::debug!(
                "Ignoring close of superseded connection {} for {}",
                connection_id,
                organization
            );
        }
    }

    /// The verdict sent to an approved master
    pub fn accepted_message(&self) -> Message {
        let endpoint = match self.root_url.agent_endpoint_url() {
            Ok(url) => Some(url.to_string()),
            Err(e) => {
                tracing::warn!("Cannot derive agent endpoint URL: {}", e);
                None
            }
        };

        Message::Accepted {
            orchestrator: self.display_name.clone(),
            endpoint,
        }
    }
}

fn inconsistent(organization: &Organization, e: impl std::fmt::Display) -> ApprovalError {
    ApprovalError::Inconsistent {
        organization: organization.clone(),
        detail: e.to_string(),
    }
}
