//! Session lifecycle manager.
//!
//! The manager creates sessions, hands connections to them, and routes
//! requests to the task that owns each one. It never touches session state
//! directly: everything goes through the session's command channel, so
//! operations on one session are applied in the order they were issued.

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::sandbox;

use super::actor::{ActorTimings, SessionActor, SessionCommand, SessionMeta};
use super::attachment::{Attachment, ConnectionId};
use super::error::{SessionError, SessionId};
use super::event::{EndReason, SessionEvent};
use super::pty::{detect_shell, PtyProcess, PtySpawnOptions};
use super::registry::{SessionHandle, SessionRegistry};

/// Channel capacity for lifecycle events.
const EVENT_CAPACITY: usize = 256;

/// Trait for session management operations.
///
/// This trait defines the interface the gateway and the control channel use
/// to drive sessions. Implementations must be thread-safe.
#[allow(async_fn_in_trait)]
pub trait SessionManager: Send + Sync {
    /// Creates a session and binds `attachment` to it.
    ///
    /// Fails without leaving anything behind when the working directory is
    /// rejected, the shell cannot start, or the session limit is reached.
    async fn create(
        &self,
        request: CreateSessionRequest,
        attachment: Attachment,
    ) -> Result<AttachedSession, SessionError>;

    /// Binds `attachment` to an existing session, replacing whichever
    /// connection was attached before.
    async fn attach(
        &self,
        session_id: &SessionId,
        attachment: Attachment,
        device_label: Option<String>,
    ) -> Result<AttachedSession, SessionError>;

    /// Unbinds a connection. Does nothing if another connection has taken
    /// the session over since.
    async fn detach(&self, session_id: &SessionId, conn_id: &ConnectionId)
        -> Result<(), SessionError>;

    /// Writes data to a session's input.
    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes a session's terminal.
    async fn resize(&self, session_id: &SessionId, cols: u16, rows: u16)
        -> Result<(), SessionError>;

    /// Sets or clears a session's display name.
    async fn rename(&self, session_id: &SessionId, name: Option<String>)
        -> Result<(), SessionError>;

    /// Destroys a session. Returns false if there was nothing to destroy.
    async fn destroy(&self, session_id: &SessionId, reason: EndReason) -> bool;

    /// Destroys every session.
    async fn destroy_all(&self, reason: EndReason);

    /// Gets information about a specific session.
    async fn get(&self, session_id: &SessionId) -> Option<SessionInfo>;

    /// Lists all live sessions, oldest first.
    async fn list(&self) -> Vec<SessionInfo>;

    /// Checks if a session exists.
    fn exists(&self, session_id: &SessionId) -> bool;

    /// Returns the number of live sessions.
    fn count(&self) -> usize;

    /// Shell process ids owned by this daemon.
    fn managed_pids(&self) -> Vec<u32>;

    /// Subscribes to lifecycle events.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;
}

/// Information about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Working directory the shell started in.
    pub cwd: String,
    /// Display name.
    pub name: Option<String>,
    /// Creation time in Unix milliseconds.
    pub created_at: u64,
    /// Label of the device that last attached.
    pub device_label: Option<String>,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Whether a connection is attached right now.
    pub has_live_connection: bool,
}

/// What a client asks for when opening a new session.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub name: Option<String>,
    pub device_label: Option<String>,
    pub env: Vec<(String, String)>,
}

/// A session freshly bound to a connection.
#[derive(Debug, Clone)]
pub struct AttachedSession {
    pub info: SessionInfo,
    /// Bytes of scrollback replayed to the connection.
    pub replayed_bytes: usize,
    /// Connection that was displaced, if any.
    pub evicted: Option<ConnectionId>,
}

/// Settings the manager applies to every session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub shell: String,
    pub default_cwd: Option<PathBuf>,
    pub sandbox_root: Option<PathBuf>,
    pub keep_alive: Duration,
    pub idle_timeout: Duration,
    pub scrollback_bytes: usize,
    pub max_sessions: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: detect_shell(Some(config.shell.clone())),
            default_cwd: config.default_cwd.clone(),
            sandbox_root: config.sandbox_root.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_minutes * 60),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            scrollback_bytes: config.scrollback_bytes,
            max_sessions: config.max_sessions,
        }
    }
}

/// Session manager backed by one task per session.
pub struct SessionManagerImpl {
    registry: SessionRegistry,
    settings: SessionSettings,
    event_tx: broadcast::Sender<SessionEvent>,
    /// Serializes the limit check with the insert that follows it.
    create_lock: Mutex<()>,
}

impl SessionManagerImpl {
    /// Creates a new session manager.
    pub fn new(settings: SessionSettings) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: SessionRegistry::new(),
            settings,
            event_tx,
            create_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Picks and checks the working directory for a new session.
    fn resolve_cwd(&self, requested: Option<&str>) -> Result<PathBuf, SessionError> {
        let candidate = requested
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.settings.default_cwd.clone())
            .or_else(|| self.settings.sandbox_root.clone())
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("/"));

        sandbox::validate(&candidate, self.settings.sandbox_root.as_deref())
            .ok_or(SessionError::SandboxViolation(candidate))
    }

    /// Sends a command to a session and waits for its answer.
    async fn request<T>(
        &self,
        session_id: &SessionId,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let handle = self
            .registry
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let (reply, rx) = oneshot::channel();
        handle
            .commands
            .send(make(reply))
            .map_err(|_| SessionError::NotFound(session_id.clone()))?;

        // The session ended before getting to the command.
        rx.await
            .map_err(|_| SessionError::NotFound(session_id.clone()))
    }
}

impl Default for SessionManagerImpl {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}

impl SessionManager for SessionManagerImpl {
    async fn create(
        &self,
        request: CreateSessionRequest,
        attachment: Attachment,
    ) -> Result<AttachedSession, SessionError> {
        let _guard = self.create_lock.lock().await;

        if self.registry.len() >= self.settings.max_sessions {
            return Err(SessionError::LimitReached(self.settings.max_sessions));
        }

        if request.cols == 0 || request.rows == 0 {
            return Err(SessionError::InvalidGeometry {
                cols: request.cols,
                rows: request.rows,
            });
        }

        let cwd = self.resolve_cwd(request.cwd.as_deref())?;
        let session_id = Uuid::new_v4().to_string();

        let (pty, events) = PtyProcess::spawn(
            &session_id,
            PtySpawnOptions {
                shell: self.settings.shell.clone(),
                cwd: Some(cwd.clone()),
                cols: request.cols,
                rows: request.rows,
                env: request.env,
            },
        )?;

        let pid = pty.pid();
        let created_at = now_millis();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            commands: commands_tx,
            pid,
            created_at,
        };
        if !self.registry.insert(session_id.clone(), handle) {
            // Dropping the PTY here kills the shell.
            return Err(SessionError::SpawnFailed(format!(
                "session id collision: {}",
                session_id
            )));
        }

        let actor = SessionActor::new(
            session_id.clone(),
            pty,
            events,
            commands_rx,
            self.registry.clone(),
            self.event_tx.clone(),
            SessionMeta {
                cwd,
                name: request.name,
                created_at,
                device_label: request.device_label,
            },
            (request.cols, request.rows),
            ActorTimings {
                idle_timeout: self.settings.idle_timeout,
                keep_alive: self.settings.keep_alive,
                scrollback_bytes: self.settings.scrollback_bytes,
            },
        );

        let mut info = actor.info();
        info.has_live_connection = true;
        let conn_id = attachment.id().clone();

        tokio::spawn(actor.run(attachment));

        tracing::info!(
            session_id = %session_id,
            conn_id = %conn_id,
            pid = ?pid,
            cwd = %info.cwd,
            cols = info.cols,
            rows = info.rows,
            "Created new session"
        );

        let _ = self.event_tx.send(SessionEvent::Created {
            session_id,
            pid,
        });

        Ok(AttachedSession {
            info,
            replayed_bytes: 0,
            evicted: None,
        })
    }

    async fn attach(
        &self,
        session_id: &SessionId,
        attachment: Attachment,
        device_label: Option<String>,
    ) -> Result<AttachedSession, SessionError> {
        let outcome = self
            .request(session_id, |reply| SessionCommand::Attach {
                attachment,
                device_label,
                reply,
            })
            .await?;

        Ok(AttachedSession {
            info: outcome.info,
            replayed_bytes: outcome.replayed_bytes,
            evicted: outcome.evicted,
        })
    }

    async fn detach(
        &self,
        session_id: &SessionId,
        conn_id: &ConnectionId,
    ) -> Result<(), SessionError> {
        let conn_id = conn_id.clone();
        self.request(session_id, |reply| SessionCommand::Detach { conn_id, reply })
            .await
            .map(|_| ())
    }

    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        let data = data.to_vec();
        self.request(session_id, |reply| SessionCommand::Write { data, reply })
            .await?
    }

    async fn resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        self.request(session_id, |reply| SessionCommand::Resize { cols, rows, reply })
            .await?
    }

    async fn rename(
        &self,
        session_id: &SessionId,
        name: Option<String>,
    ) -> Result<(), SessionError> {
        self.request(session_id, |reply| SessionCommand::Rename { name, reply })
            .await
    }

    async fn destroy(&self, session_id: &SessionId, reason: EndReason) -> bool {
        let result = self
            .request(session_id, |reply| SessionCommand::Destroy { reason, reply })
            .await;

        if result.is_err() {
            tracing::debug!(session_id = %session_id, "Destroy requested for unknown session");
        }
        result.is_ok()
    }

    async fn destroy_all(&self, reason: EndReason) {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return;
        }

        tracing::info!(count = ids.len(), reason = %reason, "Destroying all sessions");
        join_all(ids.iter().map(|id| self.destroy(id, reason.clone()))).await;
    }

    async fn get(&self, session_id: &SessionId) -> Option<SessionInfo> {
        self.request(session_id, |reply| SessionCommand::Info { reply })
            .await
            .ok()
    }

    async fn list(&self) -> Vec<SessionInfo> {
        let ids = self.registry.ids();
        join_all(ids.iter().map(|id| self.get(id)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    fn exists(&self, session_id: &SessionId) -> bool {
        self.registry.contains(session_id)
    }

    fn count(&self) -> usize {
        self.registry.len()
    }

    fn managed_pids(&self) -> Vec<u32> {
        self.registry.pids()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
