//! Orchestrator root
//!
//! Ties the registry, grant issuer and approver together, exposes the
//! provisioning and attach triggers, and supervises the agent listener.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use russh_keys::key::KeyPair;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use nc_core::config::OrchestratorConfig;
use nc_core::time::current_time_millis;
use nc_core::{ConfigError, Organization};
use nc_protocol::RefusalKind;

use crate::approval::AgentApprover;
use crate::endpoint::RootUrl;
use crate::grant::GrantIssuer;
use crate::provisioning::{MasterProvisioner, ProvisionRequest};
use crate::registry::{ChannelClosed, EntryError, MasterRegistry, MasterServer, RegistryError};
use crate::server::{ssh_config, AgentListener, ListenerContext, ListenerError, MasterEvent};

/// Alert raised while the agent listener cannot bind its port
pub const LISTENER_BIND_ALERT: &str = "agent-listener.bind";

/// Capacity of the master event queue
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Master provisioning is disabled")]
    ProvisioningDisabled,

    #[error("Failed to provision master {organization}: {source:#}")]
    Provisioning {
        organization: Organization,
        #[source]
        source: anyhow::Error,
    },

    #[error("Master {0} is not connected")]
    NotConnected(Organization),

    #[error(transparent)]
    ChannelClosed(#[from] ChannelClosed),
}

/// A condition an operator needs to act on
#[derive(Debug, Clone, Serialize)]
pub struct AdministrativeAlert {
    pub id: String,
    pub message: String,
    /// When it was raised (unix millis)
    pub raised_at: u64,
}

/// The orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<MasterRegistry>,
    grants: Arc<GrantIssuer>,
    root_url: Arc<RootUrl>,
    provisioner: Arc<dyn MasterProvisioner>,
    listener_ctx: Arc<ListenerContext>,
    listener: Mutex<Option<AgentListener>>,
    alerts: DashMap<String, AdministrativeAlert>,
}

impl Orchestrator {
    /// Build an orchestrator. The root URL is resolved here, before any
    /// listener can publish an endpoint derived from it.
    ///
    /// Returns the receiving end of the master event stream.
    pub fn new(
        config: OrchestratorConfig,
        host_key: KeyPair,
        provisioner: Arc<dyn MasterProvisioner>,
    ) -> Result<(Self, mpsc::Receiver<MasterEvent>), OrchestratorError> {
        let root_url = Arc::new(RootUrl::new(config.resolve_root_url()?));
        let registry = Arc::new(MasterRegistry::new());
        let grants = Arc::new(GrantIssuer::new());

        let approver = Arc::new(AgentApprover::new(
            Arc::clone(&registry),
            Arc::clone(&grants),
            config.display_name.clone(),
            Arc::clone(&root_url),
        ));

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let listener_ctx = Arc::new(ListenerContext {
            approver,
            events: event_tx,
            ssh_config: ssh_config(host_key, config.inactivity_timeout),
            handshake_timeout: config.handshake_timeout,
        });

        tracing::info!("Orchestrator root URL is {}", root_url.get());

        let orchestrator = Self {
            config,
            registry,
            grants,
            root_url,
            provisioner,
            listener_ctx,
            listener: Mutex::new(None),
            alerts: DashMap::new(),
        };
        Ok((orchestrator, event_rx))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MasterRegistry> {
        &self.registry
    }

    /// Create a master and start provisioning it.
    ///
    /// A grant is minted and handed to the provisioner together with the
    /// agent endpoint; the launched master presents it on first contact.
    pub async fn create_and_provision(
        &self,
        name: &str,
    ) -> Result<Arc<MasterServer>, OrchestratorError> {
        if !self.config.master_provisioning {
            return Err(OrchestratorError::ProvisioningDisabled);
        }

        let endpoint = self.root_url.agent_endpoint_url()?;
        let master = self.registry.create_master_server(name).await?;

        let grant = {
            let mut guard = master.lock().await;
            let grant = self.grants.issue(&mut guard);
            guard.set_provisioning_state()?;
            grant
        };

        let request = ProvisionRequest {
            organization: master.organization().clone(),
            grant,
            endpoint,
        };

        if let Err(source) = self.provisioner.provision(request).await {
            tracing::error!(
                "Provisioning master {} failed: {:#}",
                master.organization(),
                source
            );
            master
                .lock()
                .await
                .record_error(RefusalKind::Internal, format!("Provisioning failed: {:#}", source));
            return Err(OrchestratorError::Provisioning {
                organization: master.organization().clone(),
                source,
            });
        }

        tracing::info!("Provisioning master {}", master.organization());
        Ok(master)
    }

    /// Create a master that will be launched by other means and approved
    /// by an operator
    pub async fn create_attachable(&self, name: &str) -> Result<Arc<MasterServer>, OrchestratorError> {
        let master = self.registry.create_master_server(name).await?;
        tracing::info!("Master {} awaiting attachment", master.organization());
        Ok(master)
    }

    /// (Re)start the agent listener on `bind`.
    ///
    /// Any running listener is shut down first. On failure an administrative
    /// alert is raised and no listener runs until the next successful call;
    /// the rest of the orchestrator is unaffected.
    pub async fn configure_agent_listener(&self, bind: &str) -> Result<SocketAddr, OrchestratorError> {
        let mut slot = self.listener.lock().await;

        if let Some(previous) = slot.take() {
            previous.shutdown().await;
        }

        match AgentListener::bind(bind, Arc::clone(&self.listener_ctx), self.config.shutdown_grace)
            .await
        {
            Ok(listener) => {
                let addr = listener.local_addr();
                *slot = Some(listener);
                if self.alerts.remove(LISTENER_BIND_ALERT).is_some() {
                    tracing::info!("Agent listener recovered on {}", addr);
                }
                Ok(addr)
            }
            Err(e) => {
                tracing::error!("{}; inbound master connections are disabled", e);
                self.raise_alert(LISTENER_BIND_ALERT, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Address of the running agent listener
    pub async fn listener_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr())
    }

    pub async fn shutdown_listener(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.shutdown().await;
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");
        self.shutdown_listener().await;
    }

    pub fn root_url(&self) -> Url {
        self.root_url.get()
    }

    pub fn set_root_url(&self, raw: &str) -> Result<Url, OrchestratorError> {
        Ok(self.root_url.set(raw)?)
    }

    pub fn agent_endpoint_url(&self) -> Result<Url, OrchestratorError> {
        Ok(self.root_url.agent_endpoint_url()?)
    }

    /// Outstanding alerts, ordered by id
    pub fn alerts(&self) -> Vec<AdministrativeAlert> {
        let mut alerts: Vec<_> = self.alerts.iter().map(|a| a.value().clone()).collect();
        alerts.sort_by(|a, b| a.id.cmp(&b.id));
        alerts
    }

    /// Send application data to a connected master
    pub async fn send_to(
        &self,
        organization: &Organization,
        data: impl Into<Bytes>,
    ) -> Result<(), OrchestratorError> {
        let master = self
            .registry
            .get_by_organization(organization)
            .ok_or_else(|| RegistryError::NotFound(organization.clone()))?;

        let channel = master
            .lock()
            .await
            .channel()
            .cloned()
            .ok_or_else(|| OrchestratorError::NotConnected(organization.clone()))?;

        channel.send_data(data).await?;
        Ok(())
    }

    fn raise_alert(&self, id: &str, message: String) {
        self.alerts.insert(
            id.to_string(),
            AdministrativeAlert {
                id: id.to_string(),
                message,
                raised_at: current_time_millis(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MasterState;
    use async_trait::async_trait;

    struct FailingProvisioner;

    #[async_trait]
    impl MasterProvisioner for FailingProvisioner {
        async fn provision(&self, _request: ProvisionRequest) -> anyhow::Result<()> {
            anyhow::bail!("no capacity")
        }
    }

    fn orchestrator(
        config: OrchestratorConfig,
        provisioner: Arc<dyn MasterProvisioner>,
    ) -> Orchestrator {
        let host_key = KeyPair::generate_ed25519().unwrap();
        Orchestrator::new(config, host_key, provisioner).unwrap().0
    }

    #[tokio::test]
    async fn test_provisioning_disabled() {
        let config = OrchestratorConfig {
            master_provisioning: false,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(config, Arc::new(FailingProvisioner));

        assert!(matches!(
            orch.create_and_provision("acme").await,
            Err(OrchestratorError::ProvisioningDisabled)
        ));
        assert!(orch.registry().is_empty());

        let master = orch.create_attachable("acme").await.unwrap();
        assert_eq!(master.state().await, MasterState::Created);
    }

    #[tokio::test]
    async fn test_provisioner_failure_is_recorded() {
        let orch = orchestrator(OrchestratorConfig::default(), Arc::new(FailingProvisioner));

        let err = orch.create_and_provision("acme").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Provisioning { .. }));

        let master = orch
            .registry()
            .get_by_organization(&Organization::parse("acme").unwrap())
            .unwrap();
        let snapshot = master.snapshot().await;
        assert_eq!(snapshot.state, MasterState::Provisioning);
        assert!(snapshot.last_error.unwrap().message.contains("no capacity"));
    }

    #[tokio::test]
    async fn test_root_url_override() {
        let config = OrchestratorConfig {
            public_host: "fleet.example.com".to_string(),
            web_port: 8443,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(config, Arc::new(FailingProvisioner));

        assert_eq!(orch.root_url().as_str(), "http://fleet.example.com:8443/");
        orch.set_root_url("https://fleet.example.com/nectar").unwrap();
        assert_eq!(
            orch.agent_endpoint_url().unwrap().as_str(),
            "https://fleet.example.com/nectar/agent-port/"
        );
    }

    #[tokio::test]
    async fn test_send_to_unconnected_master() {
        let orch = orchestrator(OrchestratorConfig::default(), Arc::new(FailingProvisioner));
        let org = Organization::parse("acme").unwrap();

        assert!(matches!(
            orch.send_to(&org, &b"x"[..]).await,
            Err(OrchestratorError::Registry(RegistryError::NotFound(_)))
        ));

        orch.create_attachable("acme").await.unwrap();
        assert!(matches!(
            orch.send_to(&org, &b"x"[..]).await,
            Err(OrchestratorError::NotConnected(_))
        ));
    }
}
