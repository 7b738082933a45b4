//! Live channel to a connected master

use std::net::SocketAddr;

use bytes::Bytes;
use nc_protocol::Message;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Identifier assigned by the listener to every accepted connection
pub type ConnectionId = u64;

/// Error returned when sending on a channel whose connection is gone
#[derive(Debug, thiserror::Error)]
#[error("Channel {0} is closed")]
pub struct ChannelClosed(pub ConnectionId);

/// Handle to the bidirectional connection of an approved master.
///
/// Outbound messages are queued to the connection's writer task; closing
/// the handle tears down the underlying SSH connection.
#[derive(Debug, Clone)]
pub struct MasterChannel {
    connection_id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    opened_at: u64,
}

impl MasterChannel {
    pub fn new(
        connection_id: ConnectionId,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            remote_addr,
            outbound,
            cancel,
            opened_at: nc_core::time::current_time_millis(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// When the channel was bound (unix millis)
    pub fn opened_at(&self) -> u64 {
        self.opened_at
    }

    /// Queue a message for the master
    pub async fn send(&self, message: Message) -> Result<(), ChannelClosed> {
        if self.is_closed() {
            return Err(ChannelClosed(self.connection_id));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| ChannelClosed(self.connection_id))
    }

    /// Queue opaque application data for the master
    pub async fn send_data(&self, data: impl Into<Bytes>) -> Result<(), ChannelClosed> {
        self.send(Message::Data(data.into())).await
    }

    /// Close the connection
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::debug!("Closing channel {} to {}", self.connection_id, self.remote_addr);
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

#[cfg(test)]
pub(crate) fn test_channel(id: ConnectionId) -> (MasterChannel, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(8);
    let addr = SocketAddr::from(([127, 0, 0, 1], 40000 + id as u16));
    (MasterChannel::new(id, addr, tx, CancellationToken::new()), rx)
}
