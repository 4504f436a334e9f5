//! WebSocket listener.
//!
//! Accepts TCP connections, checks credentials inside the upgrade callback
//! so a rejected peer never completes the handshake, and hands each
//! upgraded socket to its own relay task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use super::auth::{self, Authenticator};
use super::connection;
use super::handshake::ConnectIntent;
use super::GatewayError;
use crate::session::SessionManagerImpl;

/// Upper bound on how long a client may take to finish the upgrade.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection counters, shared with the IPC status report.
#[derive(Debug, Default)]
pub struct GatewayStats {
    active: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl GatewayStats {
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn accepted_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected_connections(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Decrements the active count when a connection task ends.
struct ActiveGuard(Arc<GatewayStats>);

impl ActiveGuard {
    fn new(stats: Arc<GatewayStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct Gateway {
    listener: TcpListener,
    manager: Arc<SessionManagerImpl>,
    auth: Arc<Authenticator>,
    stats: Arc<GatewayStats>,
}

impl Gateway {
    /// Binds the listener. Port 0 picks a free port; see [`Gateway::local_addr`].
    pub async fn bind(
        addr: SocketAddr,
        manager: Arc<SessionManagerImpl>,
        auth: Authenticator,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind { addr, source })?;

        Ok(Self {
            listener,
            manager,
            auth: Arc::new(auth),
            stats: Arc::new(GatewayStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<GatewayStats> {
        Arc::clone(&self.stats)
    }

    /// Accepts connections until `cancel` fires, then closes the ones
    /// still open.
    pub async fn run(self, cancel: CancellationToken) {
        self.run_until(cancel.clone(), cancel).await
    }

    /// Accepts connections until `stop_accepting` fires. Open connections
    /// keep running until `close_connections` fires, so sessions can still
    /// say goodbye on them during shutdown.
    pub async fn run_until(
        self,
        stop_accepting: CancellationToken,
        close_connections: CancellationToken,
    ) {
        match self.listener.local_addr() {
            Ok(addr) => tracing::info!(%addr, "Gateway listening"),
            Err(e) => tracing::warn!(error = %e, "Gateway listening on unknown address"),
        }

        loop {
            tokio::select! {
                _ = stop_accepting.cancelled() => {
                    tracing::info!("Gateway stopped accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let manager = Arc::clone(&self.manager);
                    let auth = Arc::clone(&self.auth);
                    let stats = Arc::clone(&self.stats);
                    let cancel = close_connections.child_token();
                    tokio::spawn(async move {
                        let _active = ActiveGuard::new(Arc::clone(&stats));
                        match upgrade(stream, peer, &auth).await {
                            Ok((ws, intent)) => {
                                stats.accepted.fetch_add(1, Ordering::Relaxed);
                                connection::serve(ws, peer, intent, manager, cancel).await;
                            }
                            Err(GatewayError::AuthRejected) => {
                                stats.rejected.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(%peer, "Connection rejected: bad credentials");
                            }
                            Err(e) => {
                                tracing::debug!(%peer, error = %e, "Upgrade failed");
                            }
                        }
                    });
                }
            }
        }
    }
}

/// Completes the WebSocket upgrade, refusing it with 401 when the peer fails
/// the credential check.
async fn upgrade(
    stream: TcpStream,
    peer: SocketAddr,
    auth: &Authenticator,
) -> Result<(tokio_tungstenite::WebSocketStream<TcpStream>, ConnectIntent), GatewayError> {
    let mut intent = None;
    let mut denied = false;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let token = auth::extract_token(request);
        match auth.check(peer, token.as_deref()) {
            Ok(method) => {
                tracing::debug!(%peer, ?method, "Credentials accepted");
                intent = Some(ConnectIntent::from_uri(request.uri()));
                Ok(response)
            }
            Err(_) => {
                denied = true;
                let mut refusal = ErrorResponse::new(Some("unauthorized".to_string()));
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            }
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async(stream, callback);
    let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
        .await
        .map_err(|_| GatewayError::HandshakeTimeout)?;

    match result {
        Ok(ws) => Ok((ws, intent.unwrap_or_default())),
        Err(_) if denied => Err(GatewayError::AuthRejected),
        Err(e) => Err(GatewayError::Handshake(e)),
    }
}
