//! Agent protocol listener
//!
//! Owns the agent port. Each accepted connection runs in its own task,
//! bounded by the handshake timeout until the approver accepts it.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::server::Handle;
use russh_keys::key::KeyPair;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::server::handler::{ConnectionState, ListenerContext, MasterConnectionHandler};

/// How long a connection being torn down gets to finish on its own
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Connection ids are unique for the life of the process, across listeners
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind agent listener to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Build the SSH server configuration around the orchestrator host key
pub fn ssh_config(host_key: KeyPair, inactivity_timeout: Duration) -> Arc<russh::server::Config> {
    let mut config = russh::server::Config::default();
    config.keys.push(host_key);
    config.methods = russh::MethodSet::PUBLICKEY;
    config.auth_rejection_time = Duration::from_secs(1);
    config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    config.inactivity_timeout = Some(inactivity_timeout);
    Arc::new(config)
}

/// A bound, running agent listener
pub struct AgentListener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tracker: TaskTracker,
    accept_task: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
}

impl AgentListener {
    /// Bind `addr` and start accepting.
    ///
    /// Bind errors are returned to the caller; nothing is spawned in that case.
    pub(crate) async fn bind(
        addr: &str,
        ctx: Arc<ListenerContext>,
        shutdown_grace: Duration,
    ) -> Result<Self, ListenerError> {
        let bind_error = |source| ListenerError::Bind {
            addr: addr.to_string(),
            source,
        };

        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        tracing::info!("Agent listener bound to {}", local_addr);

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            ctx,
            cancel.clone(),
            tracker.clone(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            tracker,
            accept_task: Some(accept_task),
            shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, cancel live connections and release the port.
    ///
    /// The port is free once this returns. In-flight connections get
    /// `shutdown_grace` to wind down.
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down agent listener on {}", self.local_addr);
        self.cancel.cancel();

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Agent listener accept loop failed: {}", e);
            }
        }

        self.tracker.close();
        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} agent connection(s) still running after {:?}",
                self.tracker.len(),
                self.shutdown_grace
            );
        }
    }
}

impl Drop for AgentListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            result = listener.accept() => match result {
                Ok((socket, peer_addr)) => {
                    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("Connection {} accepted from {}", id, peer_addr);

                    let conn = Arc::new(ConnectionState::new(id, peer_addr, cancel.child_token()));
                    tracker.spawn(serve_connection(Arc::clone(&ctx), socket, conn));
                }
                Err(e) => {
                    tracing::error!("Failed to accept agent connection: {}", e);
                }
            }
        }
    }

    tracing::info!("Agent listener stopped accepting");
}

enum SessionEnd {
    Finished(anyhow::Result<()>),
    Cancelled,
    HandshakeTimeout,
}

async fn serve_connection(ctx: Arc<ListenerContext>, socket: TcpStream, conn: Arc<ConnectionState>) {
    let deadline = Instant::now() + ctx.handshake_timeout;
    let _ = socket.set_nodelay(true);

    let handler = MasterConnectionHandler::new(Arc::clone(&ctx), Arc::clone(&conn));
    let setup = russh::server::run_stream(Arc::clone(&ctx.ssh_config), socket, handler);

    let running = tokio::select! {
        _ = conn.cancel.cancelled() => return,
        result = tokio::time::timeout_at(deadline, setup) => match result {
            Ok(Ok(running)) => running,
            Ok(Err(e)) => {
                tracing::debug!("SSH setup failed for {}: {}", conn.peer_addr, e);
                return;
            }
            Err(_) => {
                tracing::warn!("Connection {} from {} timed out before SSH", conn.id, conn.peer_addr);
                return;
            }
        },
    };

    let handle = running.handle();
    let mut running = Box::pin(running);
    let handshake = tokio::time::sleep_until(deadline);
    tokio::pin!(handshake);
    let mut approved = false;

    let end = loop {
        tokio::select! {
            result = &mut running => break SessionEnd::Finished(result),
            _ = conn.cancel.cancelled() => break SessionEnd::Cancelled,
            _ = conn.approved.notified(), if !approved => approved = true,
            _ = &mut handshake, if !approved => break SessionEnd::HandshakeTimeout,
        }
    };

    match end {
        SessionEnd::Finished(Ok(())) => {
            tracing::debug!("Connection {} from {} closed", conn.id, conn.peer_addr);
        }
        SessionEnd::Finished(Err(e)) => {
            tracing::warn!("Connection {} from {} failed: {}", conn.id, conn.peer_addr, e);
        }
        SessionEnd::HandshakeTimeout => {
            tracing::warn!(
                "Connection {} from {} not approved within {:?}, dropping",
                conn.id,
                conn.peer_addr,
                ctx.handshake_timeout
            );
            disconnect(&handle, &mut running, "handshake timeout").await;
        }
        SessionEnd::Cancelled => {
            disconnect(&handle, &mut running, "closed by orchestrator").await;
        }
    }

    conn.cancel.cancel();
}

async fn disconnect<F>(handle: &Handle, running: &mut Pin<Box<F>>, reason: &str)
where
    F: Future,
{
    let _ = handle
        .disconnect(
            russh::Disconnect::ByApplication,
            reason.to_string(),
            "en".to_string(),
        )
        .await;
    let _ = tokio::time::timeout(DISCONNECT_GRACE, running).await;
}
