//! Handshake rules enforced per connection, driven by a bare SSH client
//! that can break them on purpose

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use russh::client;
use russh::{Channel, ChannelId};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::mpsc;
use tokio_util::codec::Decoder;

use nc_core::config::OrchestratorConfig;
use nc_core::Organization;
use nc_orchestrator::{
    Grant, MasterProvisioner, MasterServer, MasterState, Orchestrator, ProvisionRequest,
};
use nc_protocol::{Message, MessageCodec, Properties, RefusalKind, PROPERTY_GRANT};

#[derive(Default)]
struct RecordingProvisioner {
    grants: Mutex<HashMap<String, Grant>>,
}

#[async_trait]
impl MasterProvisioner for RecordingProvisioner {
    async fn provision(&self, request: ProvisionRequest) -> anyhow::Result<()> {
        self.grants
            .lock()
            .unwrap()
            .insert(request.organization.to_string(), request.grant);
        Ok(())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    provisioner: Arc<RecordingProvisioner>,
    addr: SocketAddr,
}

impl Harness {
    async fn start(handshake_timeout: Duration) -> Self {
        let config = OrchestratorConfig {
            handshake_timeout,
            shutdown_grace: Duration::from_secs(2),
            ..OrchestratorConfig::default()
        };
        let provisioner = Arc::new(RecordingProvisioner::default());
        let shared: Arc<dyn MasterProvisioner> = provisioner.clone();
        let (orchestrator, _events) =
            Orchestrator::new(config, KeyPair::generate_ed25519().unwrap(), shared).unwrap();
        let addr = orchestrator
            .configure_agent_listener("127.0.0.1:0")
            .await
            .unwrap();

        Self {
            orchestrator,
            provisioner,
            addr,
        }
    }

    /// Provision `name` and return its grant
    async fn provision(&self, name: &str) -> String {
        self.orchestrator.create_and_provision(name).await.unwrap();
        self.provisioner.grants.lock().unwrap()[name]
            .expose()
            .to_string()
    }

    fn master(&self, name: &str) -> Arc<MasterServer> {
        self.orchestrator
            .registry()
            .get_by_organization(&Organization::parse(name).unwrap())
            .unwrap()
    }
}

/// What the bare client saw from the orchestrator
#[derive(Debug)]
enum Seen {
    Message(Message),
    ChannelClosed,
    /// The SSH session is gone
    Disconnected,
}

struct BareHandler {
    seen: mpsc::UnboundedSender<Seen>,
    codec: MessageCodec,
    buffer: BytesMut,
}

impl Drop for BareHandler {
    fn drop(&mut self) {
        let _ = self.seen.send(Seen::Disconnected);
    }
}

#[async_trait]
impl client::Handler for BareHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        self.buffer.extend_from_slice(data);
        while let Some(message) = self.codec.decode(&mut self.buffer)? {
            let _ = self.seen.send(Seen::Message(message));
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let _ = self.seen.send(Seen::ChannelClosed);
        Ok(())
    }
}

/// An authenticated SSH session with no protocol logic of its own
struct BarePeer {
    session: client::Handle<BareHandler>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl BarePeer {
    async fn connect(addr: SocketAddr, organization: &str) -> Self {
        let (tx, seen) = mpsc::unbounded_channel();
        let handler = BareHandler {
            seen: tx,
            codec: MessageCodec::new(),
            buffer: BytesMut::new(),
        };

        let mut session = client::connect(Arc::new(client::Config::default()), addr, handler)
            .await
            .unwrap();
        let key = Arc::new(KeyPair::generate_ed25519().unwrap());
        assert!(session.authenticate_publickey(organization, key).await.unwrap());

        Self { session, seen }
    }

    async fn open_channel(&self) -> Channel<client::Msg> {
        self.session.channel_open_session().await.unwrap()
    }

    async fn next(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.seen.recv())
            .await
            .expect("orchestrator went quiet")
            .unwrap_or(Seen::Disconnected)
    }

    async fn next_message(&mut self) -> Message {
        match self.next().await {
            Seen::Message(message) => message,
            other => panic!("expected a message, got {:?}", other),
        }
    }

    /// Wait until the orchestrator has dropped the session
    async fn wait_disconnected(&mut self) {
        loop {
            if let Seen::Disconnected = self.next().await {
                return;
            }
        }
    }
}

async fn send(channel: &Channel<client::Msg>, message: Message) {
    let buf = MessageCodec::encode_to_vec(message).unwrap();
    channel.data(&buf[..]).await.unwrap();
}

fn assert_refused(message: Message, expected: RefusalKind) {
    match message {
        Message::Refused { kind, .. } => assert_eq!(kind, expected),
        other => panic!("expected Refused, got {:?}", other),
    }
}

#[tokio::test]
async fn test_silent_peer_is_dropped_after_handshake_timeout() {
    let h = Harness::start(Duration::from_secs(1)).await;
    h.provision("acme").await;

    let mut peer = BarePeer::connect(h.addr, "acme").await;
    let _channel = peer.open_channel().await;

    let started = tokio::time::Instant::now();
    peer.wait_disconnected().await;
    assert!(started.elapsed() < Duration::from_secs(4));

    assert_eq!(h.master("acme").state().await, MasterState::Provisioning);
}

#[tokio::test]
async fn test_first_frame_must_be_hello() {
    let h = Harness::start(Duration::from_secs(5)).await;
    h.provision("acme").await;

    let mut peer = BarePeer::connect(h.addr, "acme").await;
    let channel = peer.open_channel().await;
    send(&channel, Message::Ping { timestamp: 1 }).await;

    assert_refused(peer.next_message().await, RefusalKind::Protocol);
    peer.wait_disconnected().await;

    let snapshot = h.master("acme").snapshot().await;
    assert_eq!(snapshot.state, MasterState::Provisioning);
    assert!(snapshot.grant_pending);
}

#[tokio::test]
async fn test_malformed_frame_is_refused() {
    let h = Harness::start(Duration::from_secs(5)).await;
    h.provision("acme").await;

    let mut peer = BarePeer::connect(h.addr, "acme").await;
    let channel = peer.open_channel().await;
    channel.data(&[0xFF, 0x00, 0x00, 0x01, 0x00][..]).await.unwrap();

    assert_refused(peer.next_message().await, RefusalKind::Protocol);
    peer.wait_disconnected().await;
    assert_eq!(h.master("acme").state().await, MasterState::Provisioning);
}

#[tokio::test]
async fn test_incompatible_version_is_refused_without_spending_grant() {
    let h = Harness::start(Duration::from_secs(5)).await;
    let grant = h.provision("acme").await;

    let mut properties = Properties::new();
    properties.insert(PROPERTY_GRANT.to_string(), grant);

    let mut peer = BarePeer::connect(h.addr, "acme").await;
    let channel = peer.open_channel().await;
    send(
        &channel,
        Message::Hello {
            properties,
            version: Some("2.0".to_string()),
        },
    )
    .await;

    assert_refused(peer.next_message().await, RefusalKind::Protocol);

    let master = h.master("acme");
    let snapshot = master.snapshot().await;
    assert_eq!(snapshot.state, MasterState::Provisioning);
    assert!(snapshot.grant_pending);
    assert!(master.identity().is_none());
}

#[tokio::test]
async fn test_second_channel_is_refused() {
    let h = Harness::start(Duration::from_secs(5)).await;
    let grant = h.provision("acme").await;

    let mut peer = BarePeer::connect(h.addr, "acme").await;
    let channel = peer.open_channel().await;
    assert!(peer.session.channel_open_session().await.is_err());

    // The first channel still carries the handshake
    let mut properties = Properties::new();
    properties.insert(PROPERTY_GRANT.to_string(), grant);
    send(&channel, Message::hello(properties)).await;

    assert!(matches!(
        peer.next_message().await,
        Message::Accepted { .. }
    ));
    assert_eq!(h.master("acme").state().await, MasterState::Connected);
}
