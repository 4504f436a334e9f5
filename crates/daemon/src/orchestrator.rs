//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that owns the session
//! manager and runs the WebSocket gateway, the control socket, and the
//! lifecycle event log until shutdown.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{self, DaemonStatus, IpcRequest, IpcResponse, IpcServer};
use crate::network::{Authenticator, Gateway, GatewayStats};
use crate::session::{
    EndReason, SessionEvent, SessionManager, SessionManagerImpl, SessionSettings,
};

const STOP_REPLY_GRACE: Duration = Duration::from_millis(100);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Stopped,
    Starting,
    /// Accepting connections.
    Running,
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(OrchestratorState),
    /// A control client asked the daemon to stop.
    StopRequested,
}

/// State the control socket handler needs.
struct ControlContext {
    manager: Arc<SessionManagerImpl>,
    gateway_stats: Arc<GatewayStats>,
    listen_addr: SocketAddr,
    started_at: Instant,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl ControlContext {
    fn status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: std::process::id(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            listen_addr: self.listen_addr.to_string(),
            session_count: self.manager.count(),
            connection_count: self.gateway_stats.active_connections(),
        }
    }

    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status(self.status()),
            IpcRequest::Stop => {
                info!("Stop requested over control socket");
                // Announce after the reply has had a chance to go out.
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(STOP_REPLY_GRACE).await;
                    let _ = event_tx.send(OrchestratorEvent::StopRequested);
                });
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self.manager.list().await,
            },
            IpcRequest::KillSession { session_id } => {
                if self
                    .manager
                    .destroy(&session_id, EndReason::ClosedByUser)
                    .await
                {
                    IpcResponse::SessionKilled { session_id }
                } else {
                    IpcResponse::error(format!("session not found: {session_id}"))
                }
            }
            IpcRequest::ManagedPids => IpcResponse::Pids {
                pids: self.manager.managed_pids(),
            },
        }
    }
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    session_manager: Arc<SessionManagerImpl>,
    socket_path: PathBuf,
    listen_addr: Option<SocketAddr>,
    gateway_stats: Option<Arc<GatewayStats>>,
    shutdown_token: CancellationToken,
    /// Stops the gateway's accept loop ahead of the rest of shutdown.
    accept_token: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator. Nothing is bound until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        let settings = SessionSettings::from(&config.session);
        let (event_tx, _) = broadcast::channel(16);
        let shutdown_token = CancellationToken::new();
        let accept_token = shutdown_token.child_token();

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager: Arc::new(SessionManagerImpl::new(settings)),
            socket_path: ipc::socket_path(),
            listen_addr: None,
            gateway_stats: None,
            shutdown_token,
            accept_token,
            event_tx,
        })
    }

    /// Overrides where the control socket is created.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Binds the gateway and control socket and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.spawn_services().await {
            *self.state.write().await = OrchestratorState::Stopped;
            self.shutdown_token.cancel();
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn spawn_services(&mut self) -> Result<()> {
        let addr = bind_addr(&self.config)?;
        let auth = Authenticator::new(
            self.config.security.token.clone(),
            self.config.security.trust_localhost,
        );
        let gateway = Gateway::bind(addr, Arc::clone(&self.session_manager), auth)
            .await
            .context("Failed to start gateway")?;
        let listen_addr = gateway.local_addr()?;
        let gateway_stats = gateway.stats();
        tokio::spawn(gateway.run_until(
            self.accept_token.clone(),
            self.shutdown_token.child_token(),
        ));

        let ipc_server = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind control socket {}", self.socket_path.display()))?;
        let context = Arc::new(ControlContext {
            manager: Arc::clone(&self.session_manager),
            gateway_stats: Arc::clone(&gateway_stats),
            listen_addr,
            started_at: Instant::now(),
            event_tx: self.event_tx.clone(),
        });
        tokio::spawn(ipc_server.serve(
            move |request| {
                let context = Arc::clone(&context);
                async move { context.handle(request).await }
            },
            self.shutdown_token.child_token(),
        ));
        debug!(path = %self.socket_path.display(), "Started control socket");

        tokio::spawn(log_session_events(
            self.session_manager.subscribe(),
            self.shutdown_token.child_token(),
        ));

        self.listen_addr = Some(listen_addr);
        self.gateway_stats = Some(gateway_stats);
        Ok(())
    }

    /// Stops accepting connections and ends every session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Sessions end while their connections are still up, so each client
        // gets its session.ended before the socket closes.
        self.accept_token.cancel();

        let count = self.session_manager.count();
        if count > 0 {
            info!(count, "Ending sessions");
        }
        self.session_manager.destroy_all(EndReason::Shutdown).await;

        self.shutdown_token.cancel();
        // Catches sessions opened by connections that were mid-handshake.
        self.session_manager.destroy_all(EndReason::Shutdown).await;

        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove control socket");
            }
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn session_manager(&self) -> &Arc<SessionManagerImpl> {
        &self.session_manager
    }

    /// Address the gateway is listening on, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn connection_count(&self) -> usize {
        self.gateway_stats
            .as_ref()
            .map_or(0, |stats| stats.active_connections())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

fn bind_addr(config: &Config) -> Result<SocketAddr> {
    let ip: IpAddr = config
        .network
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.network.bind_address))?;
    Ok(SocketAddr::new(ip, config.network.port))
}

/// Traces lifecycle events until shutdown. Session tasks log the
/// transitions themselves at info.
async fn log_session_events(
    mut events: broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) => debug!(session_id = %event.session_id(), ?event, "Session event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Session event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
