//! Hand-off to whatever physically launches masters

use async_trait::async_trait;
use url::Url;

use nc_core::Organization;

use crate::grant::Grant;

/// Everything a launched master needs to find and authenticate to us
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub organization: Organization,
    /// Secret the master presents on first contact
    pub grant: Grant,
    /// Agent endpoint URL
    pub endpoint: Url,
}

/// Starts a master process somewhere and delivers its grant out of band
#[async_trait]
pub trait MasterProvisioner: Send + Sync {
    async fn provision(&self, request: ProvisionRequest) -> anyhow::Result<()>;
}
