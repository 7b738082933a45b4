//! Per-master registry entry and its trust state machine
//!
//! Every state transition goes through [`MasterGuard`], which holds the
//! entry's lock for as long as it lives. Callers take the guard, inspect the
//! current state, and apply at most one transition before dropping it, so two
//! connections for the same organization can never interleave a
//! read-modify-write.

use std::fmt;
use std::net::SocketAddr;
use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use nc_core::time::current_time_millis;
use nc_core::Organization;
use nc_protocol::RefusalKind;

use super::channel::{ConnectionId, MasterChannel};
use crate::grant::Grant;
use crate::identity::MasterIdentity;

/// Lifecycle state of a master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MasterState {
    /// Created, waiting for provisioning or manual approval
    Created,
    /// Provisioning requested and a grant minted
    Provisioning,
    /// Identity bound on first contact
    Approved,
    /// A known identity reconnected
    Reapproved,
    /// A channel is bound
    Connected,
    /// The last approval attempt failed
    ApprovalError,
}

impl MasterState {
    /// Whether an inbound connection may be evaluated against this state
    pub fn is_approvable(&self) -> bool {
        !matches!(self, MasterState::ApprovalError)
    }

    /// Whether an identity has been bound and accepted
    pub fn is_approved(&self) -> bool {
        matches!(
            self,
            MasterState::Approved | MasterState::Reapproved | MasterState::Connected
        )
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MasterState::Created => "created",
            MasterState::Provisioning => "provisioning",
            MasterState::Approved => "approved",
            MasterState::Reapproved => "reapproved",
            MasterState::Connected => "connected",
            MasterState::ApprovalError => "approval-error",
        };
        f.write_str(s)
    }
}

/// The most recent failure recorded against a master
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalFailure {
    pub kind: RefusalKind,
    pub message: String,
    /// When it happened (unix millis)
    pub at: u64,
}

/// A transition that the current state does not allow
#[derive(Debug, Error)]
pub enum EntryError {
    #[error("Master {organization}: cannot move from {from} to {to}")]
    InvalidTransition {
        organization: Organization,
        from: MasterState,
        to: MasterState,
    },

    #[error("Master {organization} is already bound to identity {bound}")]
    IdentityAlreadyBound {
        organization: Organization,
        bound: MasterIdentity,
    },

    #[error("Master {organization} has no identity bound")]
    NoIdentity { organization: Organization },
}

/// Mutable part of an entry, only reachable through [`MasterGuard`]
#[derive(Debug)]
struct MasterRecord {
    state: MasterState,
    grant: Option<Grant>,
    grant_consumed: bool,
    origin: Option<SocketAddr>,
    last_error: Option<ApprovalFailure>,
    /// State restored when the bound channel goes away
    last_approved_state: MasterState,
    channel: Option<MasterChannel>,
    state_changed_at: u64,
    approved_at: Option<u64>,
}

/// A master known to the orchestrator
#[derive(Debug)]
pub struct MasterServer {
    organization: Organization,
    created_at: u64,
    /// Set at most once, while holding the record lock
    identity: OnceLock<MasterIdentity>,
    record: Mutex<MasterRecord>,
}

impl MasterServer {
    pub(crate) fn new(organization: Organization) -> Self {
        let now = current_time_millis();
        Self {
            organization,
            created_at: now,
            identity: OnceLock::new(),
            record: Mutex::new(MasterRecord {
                state: MasterState::Created,
                grant: None,
                grant_consumed: false,
                origin: None,
                last_error: None,
                last_approved_state: MasterState::Approved,
                channel: None,
                state_changed_at: now,
                approved_at: None,
            }),
        }
    }

    pub fn organization(&self) -> &Organization {
        &self.organization
    }

    /// Bound identity. Readable without the lock.
    pub fn identity(&self) -> Option<&MasterIdentity> {
        self.identity.get()
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Take the entry lock
    pub async fn lock(&self) -> MasterGuard<'_> {
        MasterGuard {
            master: self,
            record: self.record.lock().await,
        }
    }

    pub async fn state(&self) -> MasterState {
        self.record.lock().await.state
    }

    pub async fn snapshot(&self) -> MasterSnapshot {
        self.lock().await.snapshot()
    }

    /// Operator approval of an attached master.
    ///
    /// Binds `identity` and moves the entry to `Approved` so the master's next
    /// connection goes through the identity-match path.
    pub async fn approve_manually(&self, identity: MasterIdentity) -> Result<(), EntryError> {
        let mut guard = self.lock().await;
        match guard.state() {
            MasterState::Created | MasterState::Provisioning | MasterState::ApprovalError => {}
            from => {
                return Err(EntryError::InvalidTransition {
                    organization: self.organization.clone(),
                    from,
                    to: MasterState::Approved,
                })
            }
        }

        guard.bind_identity(identity)?;
        guard.record.grant_consumed = true;
        guard.record.approved_at = Some(current_time_millis());
        guard.record.last_approved_state = MasterState::Approved;
        guard.transition(MasterState::Approved);

        tracing::info!(
            "Master {} approved by operator with identity {}",
            self.organization,
            self.identity().map(|i| i.fingerprint()).unwrap_or("?")
        );
        Ok(())
    }

    /// Operator action clearing an approval error.
    ///
    /// The entry returns to `Provisioning` if it still holds a live grant,
    /// otherwise to `Created`. The recorded failure stays visible.
    pub async fn reset_approval_error(&self) -> Result<MasterState, EntryError> {
        let mut guard = self.lock().await;
        let to = if guard.live_grant().is_some() {
            MasterState::Provisioning
        } else {
            MasterState::Created
        };

        if guard.state() != MasterState::ApprovalError {
            return Err(EntryError::InvalidTransition {
                organization: self.organization.clone(),
                from: guard.state(),
                to,
            });
        }

        guard.transition(to);
        tracing::info!("Master {} approval error cleared, now {}", self.organization, to);
        Ok(to)
    }
}

/// Exclusive access to one entry's mutable state
pub struct MasterGuard<'a> {
    master: &'a MasterServer,
    record: MutexGuard<'a, MasterRecord>,
}

impl<'a> MasterGuard<'a> {
    pub fn organization(&self) -> &'a Organization {
        &self.master.organization
    }

    pub fn state(&self) -> MasterState {
        self.record.state
    }

    pub fn identity(&self) -> Option<&'a MasterIdentity> {
        self.master.identity.get()
    }

    pub fn origin(&self) -> Option<SocketAddr> {
        self.record.origin
    }

    pub fn channel(&self) -> Option<&MasterChannel> {
        self.record.channel.as_ref()
    }

    pub fn last_error(&self) -> Option<&ApprovalFailure> {
        self.record.last_error.as_ref()
    }

    pub(crate) fn store_grant(&mut self, grant: Grant) {
        self.record.grant = Some(grant);
        self.record.grant_consumed = false;
    }

    /// The grant, unless it has already been used
    pub(crate) fn live_grant(&self) -> Option<&Grant> {
        if self.record.grant_consumed {
            None
        } else {
            self.record.grant.as_ref()
        }
    }

    /// `Created` → `Provisioning`
    pub fn set_provisioning_state(&mut self) -> Result<(), EntryError> {
        self.require(
            &[MasterState::Created, MasterState::Provisioning],
            MasterState::Provisioning,
        )?;
        self.transition(MasterState::Provisioning);
        Ok(())
    }

    /// First-contact approval: binds the identity and consumes the grant
    pub fn set_approved_state(
        &mut self,
        identity: MasterIdentity,
        origin: SocketAddr,
    ) -> Result<(), EntryError> {
        self.require(
            &[MasterState::Created, MasterState::Provisioning],
            MasterState::Approved,
        )?;
        self.bind_identity(identity)?;

        let record = &mut *self.record;
        record.grant_consumed = true;
        record.origin = Some(origin);
        record.approved_at = Some(current_time_millis());
        record.last_approved_state = MasterState::Approved;
        self.transition(MasterState::Approved);
        Ok(())
    }

    /// A known identity came back.
    ///
    /// Returns the channel it supersedes, if the entry was connected; the
    /// caller is responsible for closing it.
    pub fn set_reapproved_state(&mut self) -> Result<Option<MasterChannel>, EntryError> {
        self.require(
            &[
                MasterState::Approved,
                MasterState::Reapproved,
                MasterState::Connected,
            ],
            MasterState::Reapproved,
        )?;
        if self.identity().is_none() {
            return Err(EntryError::NoIdentity {
                organization: self.organization().clone(),
            });
        }

        let superseded = self.record.channel.take();
        self.record.last_approved_state = MasterState::Reapproved;
        self.transition(MasterState::Reapproved);
        Ok(superseded)
    }

    /// Bind the live channel.
    ///
    /// Allowed from `Connected` too, when a second approval for the same
    /// identity completes after the first has already bound; the previous
    /// channel is returned for the caller to close.
    pub fn set_connected_state(
        &mut self,
        channel: MasterChannel,
    ) -> Result<Option<MasterChannel>, EntryError> {
        self.require(
            &[
                MasterState::Approved,
                MasterState::Reapproved,
                MasterState::Connected,
            ],
            MasterState::Connected,
        )?;

        let previous = self.record.channel.replace(channel);
        self.transition(MasterState::Connected);
        Ok(previous)
    }

    /// Record a failed approval and move to `ApprovalError`
    pub fn set_approval_error_state(&mut self, kind: RefusalKind, message: impl Into<String>) {
        self.record_error(kind, message);
        if let Some(channel) = self.record.channel.take() {
            channel.close();
        }
        self.transition(MasterState::ApprovalError);
    }

    /// Unbind the channel of connection `connection_id`.
    ///
    /// Returns false (and changes nothing) if that connection is not the one
    /// bound, e.g. because it was superseded.
    pub fn set_disconnected_state(&mut self, connection_id: ConnectionId) -> bool {
        let bound = self
            .record
            .channel
            .as_ref()
            .is_some_and(|c| c.id() == connection_id);
        if !bound {
            return false;
        }

        self.record.channel = None;
        if self.record.state == MasterState::Connected {
            let restored = self.record.last_approved_state;
            self.transition(restored);
        }
        true
    }

    /// Record a failure without changing state
    pub fn record_error(&mut self, kind: RefusalKind, message: impl Into<String>) {
        self.record.last_error = Some(ApprovalFailure {
            kind,
            message: message.into(),
            at: current_time_millis(),
        });
    }

    pub fn snapshot(&self) -> MasterSnapshot {
        let record = &*self.record;
        MasterSnapshot {
            organization: self.organization().clone(),
            state: record.state,
            identity: self.identity().map(|i| i.fingerprint().to_string()),
            origin: record.origin,
            connection: record.channel.as_ref().map(|c| ConnectionSnapshot {
                id: c.id(),
                remote_addr: c.remote_addr(),
                opened_at: c.opened_at(),
            }),
            grant_pending: self.live_grant().is_some(),
            last_error: record.last_error.clone(),
            created_at: self.master.created_at,
            state_changed_at: record.state_changed_at,
            approved_at: record.approved_at,
        }
    }

    fn require(&self, allowed: &[MasterState], to: MasterState) -> Result<(), EntryError> {
        if allowed.contains(&self.record.state) {
            Ok(())
        } else {
            Err(EntryError::InvalidTransition {
                organization: self.organization().clone(),
                from: self.record.state,
                to,
            })
        }
    }

    fn bind_identity(&mut self, identity: MasterIdentity) -> Result<(), EntryError> {
        match self.master.identity.get() {
            Some(bound) if *bound == identity => Ok(()),
            Some(bound) => Err(EntryError::IdentityAlreadyBound {
                organization: self.organization().clone(),
                bound: bound.clone(),
            }),
            None => {
                // Only written under the record lock, so this cannot lose a race
                let _ = self.master.identity.set(identity);
                Ok(())
            }
        }
    }

    fn transition(&mut self, to: MasterState) {
        let from = self.record.state;
        if from != to {
            tracing::debug!("Master {}: {} -> {}", self.organization(), from, to);
        }
        self.record.state = to;
        self.record.state_changed_at = current_time_millis();
    }
}

/// Serializable view of an entry
#[derive(Debug, Clone, Serialize)]
pub struct MasterSnapshot {
    pub organization: Organization,
    pub state: MasterState,
    /// Fingerprint of the bound identity
    pub identity: Option<String>,
    pub origin: Option<SocketAddr>,
    pub connection: Option<ConnectionSnapshot>,
    /// An unconsumed grant is outstanding
    pub grant_pending: bool,
    pub last_error: Option<ApprovalFailure>,
    pub created_at: u64,
    pub state_changed_at: u64,
    pub approved_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub opened_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::GrantIssuer;
    use crate::registry::channel::test_channel;
    use russh_keys::key::KeyPair;

    fn master() -> MasterServer {
        MasterServer::new(Organization::parse("acme").unwrap())
    }

    fn identity() -> MasterIdentity {
        let key = KeyPair::generate_ed25519().unwrap();
        MasterIdentity::from_public_key(&key.clone_public_key().unwrap())
    }

    fn origin() -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 7], 51000))
    }

    #[tokio::test]
    async fn test_initial_state() {
        let master = master();
        assert_eq!(master.state().await, MasterState::Created);
        assert!(master.identity().is_none());

        let snapshot = master.snapshot().await;
        assert_eq!(snapshot.state, MasterState::Created);
        assert!(!snapshot.grant_pending);
        assert!(snapshot.connection.is_none());
    }

    #[tokio::test]
    async fn test_grant_approval_lifecycle() {
        let master = master();
        let k1 = identity();
        let mut guard = master.lock().await;

        GrantIssuer::new().issue(&mut guard);
        guard.set_provisioning_state().unwrap();
        guard.set_approved_state(k1.clone(), origin()).unwrap();

        assert_eq!(guard.state(), MasterState::Approved);
        assert_eq!(guard.identity(), Some(&k1));
        assert_eq!(guard.origin(), Some(origin()));
        assert!(guard.live_grant().is_none());

        let (channel, _rx) = test_channel(1);
        assert!(guard.set_connected_state(channel).unwrap().is_none());
        assert_eq!(guard.state(), MasterState::Connected);

        assert!(guard.set_disconnected_state(1));
        assert_eq!(guard.state(), MasterState::Approved);
        assert!(guard.channel().is_none());
    }

    #[tokio::test]
    async fn test_reapproval_supersedes_channel() {
        let master = master();
        let mut guard = master.lock().await;
        guard.set_approved_state(identity(), origin()).unwrap();

        let (first, _rx1) = test_channel(1);
        guard.set_connected_state(first.clone()).unwrap();

        let superseded = guard.set_reapproved_state().unwrap();
        assert_eq!(superseded.map(|c| c.id()), Some(1));
        assert_eq!(guard.state(), MasterState::Reapproved);

        let (second, _rx2) = test_channel(2);
        guard.set_connected_state(second).unwrap();

        // The superseded connection going away must not unbind the new one
        assert!(!guard.set_disconnected_state(1));
        assert_eq!(guard.state(), MasterState::Connected);

        assert!(guard.set_disconnected_state(2));
        assert_eq!(guard.state(), MasterState::Reapproved);
    }

    #[tokio::test]
    async fn test_connected_requires_approval() {
        let master = master();
        let mut guard = master.lock().await;
        let (channel, _rx) = test_channel(1);

        assert!(matches!(
            guard.set_connected_state(channel),
            Err(EntryError::InvalidTransition {
                from: MasterState::Created,
                to: MasterState::Connected,
                ..
            })
        ));
        assert!(guard.set_reapproved_state().is_err());
    }

    #[tokio::test]
    async fn test_identity_is_bound_once() {
        let master = master();
        let k1 = identity();
        {
            let mut guard = master.lock().await;
            guard.set_approved_state(k1.clone(), origin()).unwrap();
        }

        let result = master.approve_manually(identity()).await;
        assert!(matches!(result, Err(EntryError::InvalidTransition { .. })));
        assert_eq!(master.identity(), Some(&k1));
    }

    #[tokio::test]
    async fn test_approval_error_and_reset() {
        let master = master();
        {
            let mut guard = master.lock().await;
            GrantIssuer::new().issue(&mut guard);
            guard.set_provisioning_state().unwrap();
            guard.set_approval_error_state(RefusalKind::Security, "bad grant");
            assert_eq!(guard.state(), MasterState::ApprovalError);
            assert!(!guard.state().is_approvable());
            assert_eq!(guard.last_error().unwrap().message, "bad grant");
        }

        // The grant was never consumed, so the entry goes back to waiting for it
        assert_eq!(
            master.reset_approval_error().await.unwrap(),
            MasterState::Provisioning
        );
        assert!(master.reset_approval_error().await.is_err());

        let snapshot = master.snapshot().await;
        assert!(snapshot.grant_pending);
        assert_eq!(snapshot.last_error.unwrap().kind, RefusalKind::Security);
    }

    #[tokio::test]
    async fn test_manual_approval_from_error() {
        let master = master();
        master
            .lock()
            .await
            .set_approval_error_state(RefusalKind::Graceful, "not approved");

        let k1 = identity();
        master.approve_manually(k1.clone()).await.unwrap();
        assert_eq!(master.state().await, MasterState::Approved);
        assert_eq!(master.identity(), Some(&k1));
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let master = master();
        let json = serde_json::to_value(master.snapshot().await).unwrap();
        assert_eq!(json["organization"], "acme");
        assert_eq!(json["state"], "created");
    }
}
