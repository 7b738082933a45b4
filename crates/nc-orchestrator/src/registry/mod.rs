//! Registry of known masters
//!
//! Maps organization names to their [`MasterServer`] entries. Creation is
//! serialized under a registry-wide lock, and so is binding an identity to an
//! entry; lookups and other per-entry transitions are not.

mod channel;
mod entry;

pub use channel::{ChannelClosed, ConnectionId, MasterChannel};
pub use entry::{
    ApprovalFailure, ConnectionSnapshot, EntryError, MasterGuard, MasterServer, MasterSnapshot,
    MasterState,
};

#[cfg(test)]
pub(crate) use channel::test_channel;

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use nc_core::{InvalidOrganization, Organization};

use crate::identity::MasterIdentity;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidName(#[from] InvalidOrganization),

    #[error("A master named {0} already exists")]
    AlreadyExists(Organization),

    #[error("No master named {0}")]
    NotFound(Organization),
}

/// All masters known to the orchestrator
#[derive(Debug, Default)]
pub struct MasterRegistry {
    masters: DashMap<Organization, Arc<MasterServer>>,
    create_lock: Mutex<()>,
    bind_lock: Mutex<()>,
}

impl MasterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a name and create a fresh entry in `Created`
    pub async fn create_master_server(&self, name: &str) -> Result<Arc<MasterServer>, RegistryError> {
        let _creating = self.create_lock.lock().await;

        let organization = self.check_organization_name(name)?;
        let master = Arc::new(MasterServer::new(organization.clone()));
        self.masters.insert(organization.clone(), Arc::clone(&master));

        tracing::info!("Created master {}", organization);
        Ok(master)
    }

    /// Check that `name` is well formed and not taken, without creating
    /// anything
    pub fn check_organization_name(&self, name: &str) -> Result<Organization, RegistryError> {
        let organization = Organization::parse(name)?;
        if self.masters.contains_key(&organization) {
            return Err(RegistryError::AlreadyExists(organization));
        }
        Ok(organization)
    }

    pub fn get_by_organization(&self, organization: &Organization) -> Option<Arc<MasterServer>> {
        self.masters.get(organization).map(|m| Arc::clone(m.value()))
    }

    /// Find the entry whose bound identity is `identity`.
    ///
    /// Linear scan; only entries that have been approved carry an identity.
    pub fn get_by_identity(&self, identity: &MasterIdentity) -> Option<Arc<MasterServer>> {
        self.masters
            .iter()
            .find(|m| m.value().identity() == Some(identity))
            .map(|m| Arc::clone(m.value()))
    }

    /// Held across an identity-in-use check and the bind that follows it, so
    /// one key never ends up bound to two masters
    pub(crate) async fn lock_identity_binding(&self) -> MutexGuard<'_, ()> {
        self.bind_lock.lock().await
    }

    /// All entries, ordered by organization
    pub fn list(&self) -> Vec<Arc<MasterServer>> {
        let mut masters: Vec<_> = self.masters.iter().map(|m| Arc::clone(m.value())).collect();
        masters.sort_by(|a, b| a.organization().cmp(b.organization()));
        masters
    }

    /// Remove an entry, closing its channel if connected
    pub async fn remove(&self, organization: &Organization) -> Result<Arc<MasterServer>, RegistryError> {
        let removed = {
            let _creating = self.create_lock.lock().await;
            self.masters.remove(organization).map(|(_, m)| m)
        };
        let master = removed.ok_or_else(|| RegistryError::NotFound(organization.clone()))?;

        if let Some(channel) = master.lock().await.channel() {
            channel.close();
        }

        tracing::info!("Removed master {}", organization);
        Ok(master)
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }
}
