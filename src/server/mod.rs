//! WebSocket relay server.
//!
//! Accepts TCP clients, answers plain HTTP requests with a status page, and
//! upgrades WebSocket requests into relayed sessions.
//!
//! # Architecture
//!
//! ```text
//! TcpListener ──accept──► handle_client
//!                           │ read_request_head
//!                           ├── no Upgrade ──► 200 text/plain status
//!                           └── Upgrade ──► ReplayStream ──► WebSocket handshake
//!                                             │ TargetResolver::resolve(path)
//!                                             ├── error ──► close 1008
//!                                             └── ok ──► run_session (until closed)
//! ```
//!
//! Cancelling the shutdown token stops accepting and closes every session
//! with 1001.

// Rust guideline compliant 2026-02

pub mod http;
pub mod registry;
pub mod replay;
pub mod session;

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RelayLimits};
use crate::constants::{CLOSE_LINGER, MAX_REQUEST_HEAD};
use crate::relay::{CloseReason, ConnectionId};
use crate::target::TargetResolver;

pub use registry::{SessionInfo, SessionRegistry};
use replay::ReplayStream;
use session::WsStream;

/// Settings shared by every client task.
#[derive(Debug)]
struct ServerContext {
    resolver: TargetResolver,
    limits: RelayLimits,
    status_text: String,
    handshake_timeout: Duration,
    registry: SessionRegistry,
}

/// Bound relay server, ready to [`run`](Self::run).
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    context: Arc<ServerContext>,
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl RelayServer {
    /// Bind the listen socket described by `config`.
    pub async fn bind(config: &Config) -> Result<Self> {
        let resolver = config.target_resolver()?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .with_context(|| format!("Failed to bind {}", config.listen))?;

        let context = ServerContext {
            resolver,
            limits: config.relay_limits(),
            status_text: config.status_text.clone(),
            handshake_timeout: config.handshake_timeout(),
            registry: SessionRegistry::new(),
        };

        Ok(Self {
            listener,
            context: Arc::new(context),
            permits: Arc::new(Semaphore::new(config.max_connections)),
            max_connections: config.max_connections,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("Failed to read listener address")
    }

    /// Handle to the live session table.
    pub fn registry(&self) -> SessionRegistry {
        self.context.registry.clone()
    }

    /// Live sessions, sorted by ID.
    pub fn active_sessions(&self) -> Vec<(ConnectionId, SessionInfo)> {
        self.context.registry.snapshot()
    }

    /// Accept clients until `shutdown` is cancelled, then wait for sessions
    /// to close.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        if self.context.resolver.is_encoded() {
            log::info!("[Server] Listening on {} (targets from request path)", addr);
        } else {
            log::info!("[Server] Listening on {}", addr);
        }

        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                            log::warn!(
                                "[Server] Rejecting {}: {} connections already open",
                                peer,
                                self.max_connections
                            );
                            continue;
                        };
                        clients.spawn(handle_client(
                            Arc::clone(&self.context),
                            socket,
                            peer,
                            permit,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        log::warn!("[Server] Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = clients.join_next(), if !clients.is_empty() => {}
            }
        }

        log::info!("[Server] Shutting down, closing {} sessions", self.context.registry.len());
        let drained = tokio::time::timeout(CLOSE_LINGER * 2, async {
            while clients.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("[Server] {} client tasks did not finish, aborting", clients.len());
            clients.shutdown().await;
        }
        Ok(())
    }
}

/// WebSocket codec limits for relayed sessions.
///
/// The codec cap sits above the relay's payload limit so ordinary oversize
/// messages reach the relay and close with 1009.
fn websocket_config(limits: &RelayLimits) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    let cap = limits.max_payload_length.saturating_mul(2);
    config.max_message_size = Some(cap);
    config.max_frame_size = Some(cap);
    config
}

async fn handle_client(
    context: Arc<ServerContext>,
    mut socket: TcpStream,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
    shutdown: CancellationToken,
) {
    let head = match http::read_request_head(&mut socket, MAX_REQUEST_HEAD, context.handshake_timeout).await {
        Ok(head) => head,
        Err(e) => {
            log::debug!("[Server] Dropping {}: {}", peer, e);
            return;
        }
    };

    if !head.is_websocket {
        log::debug!("[Server] Status request from {}: {} {}", peer, head.method, head.path);
        if let Err(e) = http::write_status_response(&mut socket, &head.method, &context.status_text).await {
            log::debug!("[Server] Failed to answer {}: {}", peer, e);
        }
        return;
    }

    let http::RequestHead { path, raw, .. } = head;
    let stream = ReplayStream::new(raw, socket);
    let mut ws = match tokio_tungstenite::accept_async_with_config(stream, Some(websocket_config(&context.limits))).await
    {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("[Server] WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };

    let id = ConnectionId::generate();
    let target = match context.resolver.resolve(&path) {
        Ok(target) => target,
        Err(e) => {
            log::warn!("[Server] {} from {} rejected: {}", id, peer, e);
            reject(&mut ws, e.close_reason()).await;
            return;
        }
    };

    log::info!("[Server] {} accepted from {} for {}", id, peer, target);
    context.registry.insert(id.clone(), peer, target.clone());
    let termination = session::run_session(id.clone(), target, context.limits, ws, shutdown).await;
    context.registry.remove(&id);

    if let Some(termination) = termination {
        log::debug!("[Server] {} finished after {:.1?}", id, termination.duration);
    }
}

/// Close a session that never reached the relay core.
async fn reject(ws: &mut WsStream, reason: CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: Cow::Borrowed(reason.as_str()),
    };
    let _ = tokio::time::timeout(CLOSE_LINGER, async {
        if ws.close(Some(frame)).await.is_ok() {
            // Wait for the peer's close reply
            while let Some(Ok(_)) = ws.next().await {}
        }
    })
    .await;
}
