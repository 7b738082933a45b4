//! Outbound link to the orchestrator
//!
//! A master connects over SSH, authenticating with its key under its
//! organization name, then opens one channel and sends `Hello`. The
//! orchestrator answers with `Accepted` or `Refused`; only after `Accepted`
//! does the link carry application traffic.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, ChannelId, CryptoVec, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use nc_core::config::AgentConfig;
use nc_core::time::current_time_millis;
use nc_core::{InvalidOrganization, Organization};
use nc_protocol::{Message, MessageCodec, Properties, RefusalKind, PROPERTY_GRANT};

use super::backoff::ExponentialBackoff;

/// Capacity of the queue between the SSH handler and the link owner
const LINK_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a connection attempt did not produce a link
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Private key file missing or unreadable
    #[error("Private key not found at {path}: {source}")]
    KeyNotFound {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The configured organization is not a valid name
    #[error(transparent)]
    InvalidOrganization(#[from] InvalidOrganization),

    /// The orchestrator did not accept our key or user name
    #[error("Authentication rejected by orchestrator")]
    AuthRejected,

    /// The orchestrator's host key is not the configured one
    #[error("Host key verification failed: expected {expected}, got {actual}")]
    HostKeyRejected { expected: String, actual: String },

    /// Temporary refusal; trying again later may succeed
    #[error("Refused by orchestrator ({kind}): {reason}")]
    Refused { kind: RefusalKind, reason: String },

    /// Refusal that needs operator attention before retrying
    #[error("Rejected by orchestrator ({kind}): {reason}")]
    Rejected { kind: RefusalKind, reason: String },

    /// No verdict within the connect timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Transport or protocol failure
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConnectError {
    /// Whether the attempt may simply be repeated
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ConnectError::Refused { .. } | ConnectError::Timeout(_) | ConnectError::Other(_)
        )
    }

    fn from_refusal(kind: RefusalKind, reason: String) -> Self {
        if kind.is_retriable() {
            ConnectError::Refused { kind, reason }
        } else {
            ConnectError::Rejected { kind, reason }
        }
    }
}

/// Raised from the SSH handler when the host key check fails
#[derive(Debug, Error)]
#[error("host key {actual} does not match {expected}")]
struct HostKeyMismatch {
    expected: String,
    actual: String,
}

/// Events received from the orchestrator on an established link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Approval verdict
    Accepted {
        orchestrator: String,
        endpoint: Option<String>,
    },
    /// Refusal verdict
    Refused { kind: RefusalKind, reason: String },
    /// Application data
    Data(Bytes),
    /// Reply to one of our pings
    Pong { timestamp: u64 },
    /// The orchestrator closed the link
    Closed { reason: Option<String> },
}

/// Connects a master to the orchestrator
pub struct AgentConnector {
    config: AgentConfig,
    organization: Organization,
    key: Arc<KeyPair>,
}

impl AgentConnector {
    /// Create a connector with an in-memory key
    pub fn new(config: AgentConfig, key: KeyPair) -> Result<Self, ConnectError> {
        let organization = Organization::parse(&config.organization)?;
        Ok(Self {
            config,
            organization,
            key: Arc::new(key),
        })
    }

    /// Create a connector using the key at `config.private_key_path`
    pub fn from_config(config: AgentConfig) -> Result<Self, ConnectError> {
        let path = config.private_key_path.display().to_string();
        if !config.private_key_path.exists() {
            return Err(ConnectError::KeyNotFound {
                path,
                source: anyhow::anyhow!("File does not exist"),
            });
        }

        let key = russh_keys::load_secret_key(&config.private_key_path, None).map_err(|e| {
            ConnectError::KeyNotFound {
                path,
                source: anyhow::anyhow!("Failed to load key: {}", e),
            }
        })?;

        Self::new(config, key)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn organization(&self) -> &Organization {
        &self.organization
    }

    /// One attempt, bounded by the connect timeout
    pub async fn connect(&self) -> Result<ActiveLink, ConnectError> {
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, self.try_connect())
            .await
            .map_err(|_| ConnectError::Timeout(timeout))?
    }

    /// Connect, retrying graceful refusals and transport failures.
    ///
    /// Security rejections and authentication failures are returned at once.
    pub async fn connect_with_retry(
        &self,
        backoff: &mut ExponentialBackoff,
    ) -> Result<ActiveLink, ConnectError> {
        loop {
            match self.connect().await {
                Ok(link) => {
                    backoff.reset();
                    tracing::info!(
                        "Connected to {} at {} as {}",
                        link.orchestrator(),
                        self.config.orchestrator_address,
                        self.organization
                    );
                    return Ok(link);
                }
                Err(e) if !e.is_retriable() => {
                    tracing::error!("Not retrying: {}", e);
                    return Err(e);
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!("Connection failed: {}. Retrying in {:?}", e, delay);
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(
                            "Giving up after {} attempts: {}",
                            backoff.attempts(),
                            e
                        );
                        return Err(e);
                    }
                },
            }
        }
    }

    async fn try_connect(&self) -> Result<ActiveLink, ConnectError> {
        let ssh_config = Arc::new(Config::default());

        let (event_tx, mut event_rx) = mpsc::channel(LINK_EVENT_CHANNEL_CAPACITY);
        let handler = LinkHandler::new(self.config.orchestrator_host_key.clone(), event_tx);

        tracing::debug!("Connecting to {}", self.config.orchestrator_address);
        let mut session = client::connect(ssh_config, &self.config.orchestrator_address, handler)
            .await
            .map_err(|e| match e.downcast::<HostKeyMismatch>() {
                Ok(mismatch) => ConnectError::HostKeyRejected {
                    expected: mismatch.expected,
                    actual: mismatch.actual,
                },
                Err(e) => ConnectError::Other(e.context(format!(
                    "Failed to connect to {}",
                    self.config.orchestrator_address
                ))),
            })?;

        tracing::debug!("Authenticating as '{}'", self.organization);
        let authenticated = session
            .authenticate_publickey(self.organization.as_str(), Arc::clone(&self.key))
            .await
            .context("Authentication error")?;

        if !authenticated {
            return Err(ConnectError::AuthRejected);
        }

        let channel = session
            .channel_open_session()
            .await
            .context("Failed to open session channel")?;

        send_message(&channel, Message::hello(self.hello_properties())).await?;

        // The first frame back is the verdict
        let verdict = event_rx.recv().await;
        match verdict {
            Some(LinkEvent::Accepted {
                orchestrator,
                endpoint,
            }) => Ok(ActiveLink {
                session,
                channel,
                events: event_rx,
                orchestrator,
                endpoint,
            }),

            Some(LinkEvent::Refused { kind, reason }) => {
                let _ = session
                    .disconnect(Disconnect::ByApplication, "refused", "en")
                    .await;
                Err(ConnectError::from_refusal(kind, reason))
            }

            Some(other) => Err(ConnectError::Other(anyhow::anyhow!(
                "Expected a verdict, got {:?}",
                other
            ))),

            None => Err(ConnectError::Other(anyhow::anyhow!(
                "Connection closed before a verdict"
            ))),
        }
    }

    fn hello_properties(&self) -> Properties {
        let mut properties = self.config.properties.clone();
        if let Some(grant) = &self.config.grant {
            properties.insert(PROPERTY_GRANT.to_string(), grant.clone());
        }
        properties
    }
}

/// An approved link to the orchestrator
pub struct ActiveLink {
    session: Handle<LinkHandler>,
    channel: Channel<Msg>,
    events: mpsc::Receiver<LinkEvent>,
    orchestrator: String,
    endpoint: Option<String>,
}

impl ActiveLink {
    /// Display name the orchestrator announced
    pub fn orchestrator(&self) -> &str {
        &self.orchestrator
    }

    /// Agent endpoint URL the orchestrator announced
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        send_message(&self.channel, message).await
    }

    pub async fn send_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_message(Message::Data(data.into())).await
    }

    pub async fn ping(&self) -> Result<()> {
        self.send_message(Message::Ping {
            timestamp: current_time_millis(),
        })
        .await
    }

    /// Next event, or `None` once the link is gone
    pub async fn recv_event(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    pub async fn close(self) -> Result<()> {
        let _ = self
            .send_message(Message::Close {
                reason: Some("agent shutting down".to_string()),
            })
            .await;
        self.session
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await?;
        Ok(())
    }
}

async fn send_message(channel: &Channel<Msg>, message: Message) -> Result<()> {
    let buf = MessageCodec::encode_to_vec(message).context("Failed to encode message")?;
    channel
        .data(&buf[..])
        .await
        .context("Failed to send data")?;
    Ok(())
}

/// SSH client handler for the link
struct LinkHandler {
    /// Expected host key fingerprint
    expected_host_key: Option<String>,
    event_tx: mpsc::Sender<LinkEvent>,
    codec: MessageCodec,
    buffer: BytesMut,
}

impl LinkHandler {
    fn new(expected_host_key: Option<String>, event_tx: mpsc::Sender<LinkEvent>) -> Self {
        Self {
            expected_host_key,
            event_tx,
            codec: MessageCodec::new(),
            buffer: BytesMut::with_capacity(8192),
        }
    }

    async fn handle_message(
        &self,
        message: Message,
        channel: ChannelId,
        session: &mut client::Session,
    ) {
        let event = match message {
            Message::Accepted {
                orchestrator,
                endpoint,
            } => LinkEvent::Accepted {
                orchestrator,
                endpoint,
            },
            Message::Refused { kind, reason } => LinkEvent::Refused { kind, reason },
            Message::Data(data) => LinkEvent::Data(data),
            Message::Pong { timestamp } => LinkEvent::Pong { timestamp },
            Message::Close { reason } => LinkEvent::Closed { reason },
            Message::Ping { timestamp } => {
                match MessageCodec::encode_to_vec(Message::Pong { timestamp }) {
                    Ok(buf) => {
                        session.data(channel, CryptoVec::from_slice(&buf));
                    }
                    Err(e) => tracing::error!("Failed to encode pong: {}", e),
                }
                return;
            }
            Message::Hello { .. } => {
                tracing::warn!("Unexpected Hello from orchestrator");
                return;
            }
        };

        let _ = self.event_tx.send(event).await;
    }
}

#[async_trait]
impl client::Handler for LinkHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Orchestrator host key: {}", fingerprint);

        match &self.expected_host_key {
            Some(expected) if *expected != fingerprint => Err(HostKeyMismatch {
                expected: expected.clone(),
                actual: fingerprint,
            }
            .into()),
            _ => Ok(true),
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        self.buffer.extend_from_slice(data);

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(message)) => self.handle_message(message, channel, session).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Protocol error: {}", e);
                    self.buffer.clear();
                    break;
                }
            }
        }

        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed by orchestrator");
        let _ = self.event_tx.send(LinkEvent::Closed { reason: None }).await;
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF");
        Ok(())
    }
}
