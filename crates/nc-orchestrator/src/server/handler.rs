//! SSH handler for one inbound master connection
//!
//! Authentication establishes who the peer claims to be (the SSH user name is
//! the organization) and which key it holds. Nothing is decided until the
//! peer's `Hello` arrives on its session channel; the approver then runs
//! exactly once, and only an accepted connection may exchange further frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use russh_keys::key::PublicKey;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use nc_core::Organization;
use nc_protocol::{Message, MessageCodec, Properties, RefusalKind, PROTOCOL_VERSION};

use crate::approval::{AgentApprover, Approval, HandshakeRequest};
use crate::identity::MasterIdentity;
use crate::registry::{ConnectionId, MasterChannel};

/// How long a refused connection stays open so the verdict can be read
const REFUSAL_LINGER: Duration = Duration::from_secs(1);

/// Capacity of a connection's outbound queue
const OUTBOUND_QUEUE: usize = 256;

/// Events emitted by connection handlers
#[derive(Debug, Clone)]
pub enum MasterEvent {
    /// A master was approved and its channel bound
    Connected {
        organization: Organization,
        identity: MasterIdentity,
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        approval: Approval,
    },
    /// A connection was refused
    Refused {
        organization: Option<Organization>,
        remote_addr: SocketAddr,
        kind: RefusalKind,
        reason: String,
    },
    /// Application data from a connected master
    Data {
        organization: Organization,
        connection_id: ConnectionId,
        data: Bytes,
    },
    /// An approved connection ended
    Disconnected {
        organization: Organization,
        connection_id: ConnectionId,
    },
}

impl MasterEvent {
    /// Log the event for operators.
    ///
    /// Security and internal refusals need investigation and are logged as
    /// errors; protocol refusals as warnings; graceful ones are routine.
    pub fn log(&self) {
        match self {
            MasterEvent::Connected {
                organization,
                identity,
                connection_id,
                remote_addr,
                approval,
            } => {
                tracing::info!(
                    "Master {} connected from {} ({:?}, key {}, connection {})",
                    organization,
                    remote_addr,
                    approval,
                    identity,
                    connection_id
                );
            }

            MasterEvent::Refused {
                organization,
                remote_addr,
                kind,
                reason,
            } => {
                let organization = organization
                    .as_ref()
                    .map(|o| o.as_str())
                    .unwrap_or("<unauthenticated>");
                match kind {
                    RefusalKind::Security | RefusalKind::Internal => tracing::error!(
                        "Refused {} from {} ({}): {}",
                        organization,
                        remote_addr,
                        kind,
                        reason
                    ),
                    RefusalKind::Protocol => tracing::warn!(
                        "Refused {} from {} ({}): {}",
                        organization,
                        remote_addr,
                        kind,
                        reason
                    ),
                    RefusalKind::Graceful => tracing::info!(
                        "Refused {} from {} ({}): {}",
                        organization,
                        remote_addr,
                        kind,
                        reason
                    ),
                }
            }

            MasterEvent::Data {
                organization,
                connection_id,
                data,
            } => {
                tracing::trace!(
                    "{} bytes from {} on connection {}",
                    data.len(),
                    organization,
                    connection_id
                );
            }

            MasterEvent::Disconnected {
                organization,
                connection_id,
            } => {
                tracing::info!(
                    "Master {} disconnected (connection {})",
                    organization,
                    connection_id
                );
            }
        }
    }
}

/// State shared by every connection of one listener
pub(crate) struct ListenerContext {
    pub approver: Arc<AgentApprover>,
    pub events: mpsc::Sender<MasterEvent>,
    pub ssh_config: Arc<russh::server::Config>,
    pub handshake_timeout: Duration,
}

impl ListenerContext {
    pub fn emit(&self, event: MasterEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            tracing::warn!("Event queue full, dropping {:?}", event);
        }
    }
}

/// Per-connection state shared between the handler and the task driving it
pub(crate) struct ConnectionState {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub cancel: CancellationToken,
    /// Signalled once the approver accepted the connection
    pub approved: Notify,
}

impl ConnectionState {
    pub fn new(id: ConnectionId, peer_addr: SocketAddr, cancel: CancellationToken) -> Self {
        Self {
            id,
            peer_addr,
            cancel,
            approved: Notify::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingHello,
    Approved,
    Refused,
}

/// Handler for a single master connection
pub(crate) struct MasterConnectionHandler {
    ctx: Arc<ListenerContext>,
    conn: Arc<ConnectionState>,
    /// Claimed organization (set at auth)
    organization: Option<Organization>,
    /// Authenticated key (set at auth)
    identity: Option<MasterIdentity>,
    /// The one session channel
    channel: Option<ChannelId>,
    phase: Phase,
    codec: MessageCodec,
    buffer: BytesMut,
    /// Forwards queued outbound messages to the peer once approved
    pump: Option<tokio::task::JoinHandle<()>>,
    /// Organization whose entry this connection's channel is bound to
    bound: Option<Organization>,
}

impl MasterConnectionHandler {
    pub fn new(ctx: Arc<ListenerContext>, conn: Arc<ConnectionState>) -> Self {
        Self {
            ctx,
            conn,
            organization: None,
            identity: None,
            channel: None,
            phase: Phase::AwaitingHello,
            codec: MessageCodec::new(),
            buffer: BytesMut::with_capacity(8192),
            pump: None,
            bound: None,
        }
    }

    async fn handle_message(&mut self, message: Message, session: &mut Session) {
        match (self.phase, message) {
            (Phase::AwaitingHello, Message::Hello { properties, version }) => {
                self.approve(properties, version, session).await;
            }

            (Phase::AwaitingHello, other) => {
                self.refuse(
                    RefusalKind::Protocol,
                    format!("Expected Hello, got {:?}", other.message_type()),
                    session,
                );
            }

            (Phase::Approved, Message::Ping { timestamp }) => {
                self.send_message(session, Message::Pong { timestamp });
            }

            (Phase::Approved, Message::Pong { timestamp }) => {
                let latency = nc_core::time::elapsed_millis(timestamp);
                tracing::trace!("Pong from connection {}, latency={}ms", self.conn.id, latency);
            }

            (Phase::Approved, Message::Data(data)) => {
                if let Some(organization) = &self.organization {
                    self.ctx.emit(MasterEvent::Data {
                        organization: organization.clone(),
                        connection_id: self.conn.id,
                        data,
                    });
                }
            }

            (Phase::Approved, Message::Close { reason }) => {
                tracing::info!(
                    "Connection {} closed by master: {}",
                    self.conn.id,
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.conn.cancel.cancel();
            }

            (Phase::Approved, other) => {
                tracing::warn!(
                    "Unexpected {:?} on approved connection {}",
                    other.message_type(),
                    self.conn.id
                );
            }

            (Phase::Refused, _) => {}
        }
    }

    /// Run the decision for this connection's `Hello`
    async fn approve(
        &mut self,
        properties: Properties,
        version: Option<String>,
        session: &mut Session,
    ) {
        let (Some(organization), Some(identity)) = (self.organization.clone(), self.identity.clone())
        else {
            self.refuse(RefusalKind::Protocol, "Hello before authentication", session);
            return;
        };

        if let Some(version) = &version {
            if !is_compatible_version(version) {
                self.refuse(
                    RefusalKind::Protocol,
                    format!(
                        "Unsupported protocol version {} (expected {})",
                        version, PROTOCOL_VERSION
                    ),
                    session,
                );
                return;
            }
        }

        let request = HandshakeRequest {
            organization: organization.clone(),
            identity: identity.clone(),
            properties,
            address: self.conn.peer_addr,
        };

        let approval = match self.ctx.approver.on_connecting(&request).await {
            Ok(approval) => approval,
            Err(e) => {
                self.refuse(e.kind(), e.to_string(), session);
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let channel = MasterChannel::new(
            self.conn.id,
            self.conn.peer_addr,
            outbound_tx,
            self.conn.cancel.clone(),
        );

        if let Err(e) = self
            .ctx
            .approver
            .on_connected(&organization, &identity, channel)
            .await
        {
            self.refuse(e.kind(), e.to_string(), session);
            return;
        }

        self.bound = Some(organization.clone());
        self.phase = Phase::Approved;
        self.conn.approved.notify_one();

        let accepted = self.ctx.approver.accepted_message();
        self.send_message(session, accepted);
        self.start_outbound_pump(outbound_rx, session.handle());

        self.ctx.emit(MasterEvent::Connected {
            organization,
            identity,
            connection_id: self.conn.id,
            remote_addr: self.conn.peer_addr,
            approval,
        });
    }

    /// Send a refusal, close the channel and drop the connection shortly after
    fn refuse(&mut self, kind: RefusalKind, reason: impl Into<String>, session: &mut Session) {
        let reason = reason.into();
        tracing::debug!(
            "Refusing connection {} from {} ({}): {}",
            self.conn.id,
            self.conn.peer_addr,
            kind,
            reason
        );

        self.send_message(session, Message::refused(kind, reason.clone()));
        if let Some(channel) = self.channel {
            session.close(channel);
        }
        self.phase = Phase::Refused;

        let cancel = self.conn.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REFUSAL_LINGER).await;
            cancel.cancel();
        });

        self.ctx.emit(MasterEvent::Refused {
            organization: self.organization.clone(),
            remote_addr: self.conn.peer_addr,
            kind,
            reason,
        });
    }

    fn send_message(&self, session: &mut Session, message: Message) {
        let Some(channel) = self.channel else {
            return;
        };

        match MessageCodec::encode_to_vec(message) {
            Ok(buf) => {
                session.data(channel, CryptoVec::from_slice(&buf));
            }
            Err(e) => tracing::error!("Failed to encode message: {}", e),
        }
    }

    /// Forward messages queued on the bound [`MasterChannel`] to the peer
    fn start_outbound_pump(&mut self, mut outbound_rx: mpsc::Receiver<Message>, handle: Handle) {
        let Some(channel) = self.channel else {
            return;
        };

        let cancel = self.conn.cancel.clone();
        let connection_id = self.conn.id;

        self.pump = Some(tokio::spawn(async move {
            tracing::debug!("Outbound pump started for connection {}", connection_id);

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = outbound_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let buf = match MessageCodec::encode_to_vec(message) {
                    Ok(buf) => buf,
                    Err(e) => {
                        tracing::error!("Failed to encode outbound message: {}", e);
                        continue;
                    }
                };

                if handle.data(channel, CryptoVec::from_slice(&buf)).await.is_err() {
                    tracing::debug!("Connection {} gone, stopping pump", connection_id);
                    break;
                }
            }

            tracing::debug!("Outbound pump stopped for connection {}", connection_id);
        }));
    }
}

impl Drop for MasterConnectionHandler {
    /// The session is over: stop the pump and unbind the channel, however
    /// the connection ended
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }

        let Some(organization) = self.bound.take() else {
            return;
        };
        self.conn.cancel.cancel();

        let ctx = Arc::clone(&self.ctx);
        let connection_id = self.conn.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    ctx.approver.on_disconnected(&organization, connection_id).await;
                    ctx.emit(MasterEvent::Disconnected {
                        organization,
                        connection_id,
                    });
                });
            }
            Err(_) => tracing::warn!(
                "Connection {} of {} ended outside the runtime, channel left bound",
                connection_id,
                organization
            ),
        }
    }
}

#[async_trait]
impl Handler for MasterConnectionHandler {
    type Error = anyhow::Error;

    /// Public-key authentication.
    ///
    /// Possession of the key is proven by the SSH layer. Here we only check
    /// that the user name is a well-formed organization and remember what was
    /// presented; approval happens on `Hello`.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let identity = MasterIdentity::from_public_key(public_key);

        let organization = match Organization::parse(user) {
            Ok(organization) => organization,
            Err(e) => {
                tracing::warn!(
                    "Auth rejected for {} from {}: {}",
                    identity,
                    self.conn.peer_addr,
                    e
                );
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        tracing::debug!(
            "Connection {} from {} authenticated as {} with key {}",
            self.conn.id,
            self.conn.peer_addr,
            organization,
            identity
        );

        self.organization = Some(organization);
        self.identity = Some(identity);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.channel.is_some() {
            tracing::warn!(
                "Connection {} tried to open a second channel",
                self.conn.id
            );
            return Ok(false);
        }

        tracing::debug!("Channel {:?} opened on connection {}", channel.id(), self.conn.id);
        self.channel = Some(channel.id());
        Ok(true)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if Some(channel) != self.channel || self.phase == Phase::Refused {
            return Ok(());
        }

        tracing::trace!("Received {} bytes on connection {}", data.len(), self.conn.id);
        self.buffer.extend_from_slice(data);

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(message)) => {
                    self.handle_message(message, session).await;
                    if self.phase == Phase::Refused {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.buffer.clear();
                    self.refuse(RefusalKind::Protocol, format!("Malformed frame: {}", e), session);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel {:?} EOF on connection {}", channel, self.conn.id);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if Some(channel) == self.channel {
            tracing::debug!("Channel closed on connection {}", self.conn.id);
            self.conn.cancel.cancel();
        }
        Ok(())
    }
}

/// Masters speaking any 1.x version are accepted
fn is_compatible_version(version: &str) -> bool {
    version.split('.').next() == PROTOCOL_VERSION.split('.').next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    use nc_core::config::parse_root_url;
    use russh_keys::key::KeyPair;

    use crate::endpoint::RootUrl;
    use crate::grant::GrantIssuer;
    use crate::registry::{MasterRegistry, MasterState};
    use crate::server::ssh_config;

    fn context(registry: &Arc<MasterRegistry>) -> (Arc<ListenerContext>, mpsc::Receiver<MasterEvent>) {
        let approver = Arc::new(AgentApprover::new(
            Arc::clone(registry),
            Arc::new(GrantIssuer::new()),
            "Nectar Test",
            Arc::new(RootUrl::new(parse_root_url("https://nectar.test").unwrap())),
        ));
        let (events, events_rx) = mpsc::channel(16);
        let ctx = ListenerContext {
            approver,
            events,
            ssh_config: ssh_config(KeyPair::generate_ed25519().unwrap(), Duration::from_secs(60)),
            handshake_timeout: Duration::from_secs(5),
        };
        (Arc::new(ctx), events_rx)
    }

    #[tokio::test]
    async fn test_dropping_bound_handler_unbinds_channel() {
        let registry = Arc::new(MasterRegistry::new());
        let (ctx, mut events) = context(&registry);

        let key = KeyPair::generate_ed25519().unwrap();
        let identity = MasterIdentity::from_public_key(&key.clone_public_key().unwrap());
        let master = registry.create_master_server("acme").await.unwrap();
        master.approve_manually(identity.clone()).await.unwrap();
        let organization = master.organization().clone();

        let addr = SocketAddr::from(([127, 0, 0, 1], 40022));
        let conn = Arc::new(ConnectionState::new(7, addr, CancellationToken::new()));
        let request = HandshakeRequest {
            organization: organization.clone(),
            identity: identity.clone(),
            properties: Properties::new(),
            address: addr,
        };
        ctx.approver.on_connecting(&request).await.unwrap();

        let (outbound, _outbound_rx) = mpsc::channel(4);
        let channel = MasterChannel::new(7, addr, outbound, conn.cancel.clone());
        ctx.approver
            .on_connected(&organization, &identity, channel)
            .await
            .unwrap();
        assert_eq!(master.state().await, MasterState::Connected);

        // Bound late, after the listener stopped watching the connection
        let mut handler = MasterConnectionHandler::new(Arc::clone(&ctx), Arc::clone(&conn));
        handler.bound = Some(organization.clone());
        drop(handler);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            MasterEvent::Disconnected {
                connection_id: 7,
                ..
            }
        ));
        assert_eq!(master.state().await, MasterState::Reapproved);
        assert!(conn.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropping_unbound_handler_leaves_entry_alone() {
        let registry = Arc::new(MasterRegistry::new());
        let (ctx, mut events) = context(&registry);
        registry.create_master_server("acme").await.unwrap();

        let addr = SocketAddr::from(([127, 0, 0, 1], 40023));
        let conn = Arc::new(ConnectionState::new(8, addr, CancellationToken::new()));
        drop(MasterConnectionHandler::new(ctx, Arc::clone(&conn)));

        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
        assert!(!conn.cancel.is_cancelled());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logged(event: &MasterEvent) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        tracing::subscriber::with_default(subscriber, || event.log());

        let bytes = logs.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    fn refused(kind: RefusalKind) -> MasterEvent {
        MasterEvent::Refused {
            organization: Some(Organization::parse("acme").unwrap()),
            remote_addr: SocketAddr::from(([192, 0, 2, 10], 50022)),
            kind,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_refusals_are_logged_by_severity() {
        let security = logged(&refused(RefusalKind::Security));
        assert!(security.contains("ERROR"), "{}", security);

        let internal = logged(&refused(RefusalKind::Internal));
        assert!(internal.contains("ERROR"), "{}", internal);

        let protocol = logged(&refused(RefusalKind::Protocol));
        assert!(protocol.contains("WARN"), "{}", protocol);
        assert!(!protocol.contains("ERROR"));

        let graceful = logged(&refused(RefusalKind::Graceful));
        assert!(graceful.contains("INFO"), "{}", graceful);
        assert!(!graceful.contains("WARN") && !graceful.contains("ERROR"));
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible_version("1.0"));
        assert!(is_compatible_version("1.3"));
        assert!(!is_compatible_version("2.0"));
        assert!(!is_compatible_version("banana"));
    }
}
