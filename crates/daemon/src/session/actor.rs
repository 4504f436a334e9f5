//! The task that owns one session.
//!
//! Every operation on a session, from whichever connection or control
//! channel it comes, is a [`SessionCommand`] handled here one at a time.
//! The same loop consumes the PTY's event stream and the two timers, so an
//! attach can never interleave with live output or with a destroy.

use std::path::PathBuf;
use std::time::Duration;

use protocol::ServerMessage;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use super::attachment::{Attachment, ConnectionId};
use super::error::{SessionError, SessionId};
use super::event::{EndReason, SessionEvent};
use super::manager::SessionInfo;
use super::output::OutputDecoder;
use super::pty::{PtyEvent, PtyEvents, PtyProcess};
use super::registry::SessionRegistry;
use super::scrollback::Scrollback;

/// Requests handled by a session task.
pub(crate) enum SessionCommand {
    Attach {
        attachment: Attachment,
        device_label: Option<String>,
        reply: oneshot::Sender<AttachOutcome>,
    },
    Detach {
        conn_id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Resize {
        cols: u16,
        rows: u16,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Rename {
        name: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Info {
        reply: oneshot::Sender<SessionInfo>,
    },
    Destroy {
        reason: EndReason,
        reply: oneshot::Sender<()>,
    },
}

/// Result of binding a connection to a session.
#[derive(Debug)]
pub(crate) struct AttachOutcome {
    pub info: SessionInfo,
    pub replayed_bytes: usize,
    pub evicted: Option<ConnectionId>,
}

/// Descriptive fields fixed or set around creation.
#[derive(Debug, Clone)]
pub(crate) struct SessionMeta {
    pub cwd: PathBuf,
    pub name: Option<String>,
    pub created_at: u64,
    pub device_label: Option<String>,
}

/// Timing and buffer settings for one session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActorTimings {
    pub idle_timeout: Duration,
    pub keep_alive: Duration,
    pub scrollback_bytes: usize,
}

pub(crate) struct SessionActor {
    id: SessionId,
    pty: PtyProcess,
    events: PtyEvents,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    registry: SessionRegistry,
    event_tx: broadcast::Sender<SessionEvent>,

    decoder: OutputDecoder,
    scrollback: Scrollback,
    attachment: Option<Attachment>,
    meta: SessionMeta,
    cols: u16,
    rows: u16,

    timings: ActorTimings,
    idle_deadline: Option<Instant>,
    destroy_deadline: Option<Instant>,

    /// Callers waiting for teardown to finish.
    destroy_replies: Vec<oneshot::Sender<()>>,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        pty: PtyProcess,
        events: PtyEvents,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        registry: SessionRegistry,
        event_tx: broadcast::Sender<SessionEvent>,
        meta: SessionMeta,
        (cols, rows): (u16, u16),
        timings: ActorTimings,
    ) -> Self {
        Self {
            id,
            pty,
            events,
            commands,
            registry,
            event_tx,
            decoder: OutputDecoder::new(),
            scrollback: Scrollback::new(timings.scrollback_bytes),
            attachment: None,
            meta,
            cols,
            rows,
            timings,
            idle_deadline: None,
            destroy_deadline: None,
            destroy_replies: Vec::new(),
        }
    }

    /// Snapshot of the session as the outside world sees it.
    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            pid: self.pty.pid(),
            cwd: self.meta.cwd.display().to_string(),
            name: self.meta.name.clone(),
            created_at: self.meta.created_at,
            device_label: self.meta.device_label.clone(),
            cols: self.cols,
            rows: self.rows,
            has_live_connection: self.attachment.is_some(),
        }
    }

    /// Runs the session until it is destroyed, starting bound to the
    /// connection that created it.
    pub(crate) async fn run(mut self, initial: Attachment) {
        self.bind(initial);

        let reason = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(reason) = self.handle(command) {
                            break reason;
                        }
                    }
                    None => break EndReason::Shutdown,
                },
                event = self.events.recv() => match event {
                    Some(PtyEvent::Output(bytes)) => self.on_output(&bytes),
                    Some(PtyEvent::Exited(exit)) => break EndReason::ProcessExited { code: exit.code },
                    None => break EndReason::ProcessExited { code: None },
                },
                _ = sleep_until_opt(self.idle_deadline) => self.on_idle(),
                _ = sleep_until_opt(self.destroy_deadline) => {
                    break EndReason::Expired { after: self.timings.keep_alive };
                }
            }
        };

        self.teardown(reason);
    }

    /// Applies one command. Returns a reason when the session must end.
    fn handle(&mut self, command: SessionCommand) -> Option<EndReason> {
        match command {
            SessionCommand::Attach {
                attachment,
                device_label,
                reply,
            } => {
                let outcome = self.attach(attachment, device_label);
                let _ = reply.send(outcome);
            }
            SessionCommand::Detach { conn_id, reply } => {
                let _ = reply.send(self.detach(&conn_id));
            }
            SessionCommand::Write { data, reply } => {
                let _ = reply.send(self.pty.write(&data));
            }
            SessionCommand::Resize { cols, rows, reply } => {
                let _ = reply.send(self.resize(cols, rows));
            }
            SessionCommand::Rename { name, reply } => {
                self.meta.name = name;
                let _ = reply.send(());
            }
            SessionCommand::Info { reply } => {
                let _ = reply.send(self.info());
            }
            SessionCommand::Destroy { reason, reply } => {
                self.destroy_replies.push(reply);
                return Some(reason);
            }
        }
        None
    }

    /// Replays scrollback and announces the session on a new attachment.
    /// Returns how many bytes were replayed.
    fn bind(&mut self, mut attachment: Attachment) -> usize {
        let replay = self.scrollback.contents();
        let replayed_bytes = replay.len();
        if !replay.is_empty() {
            attachment.send(ServerMessage::output(self.id.clone(), replay));
        }
        attachment.send(self.created_message());
        self.attachment = Some(attachment);
        replayed_bytes
    }

    fn attach(&mut self, attachment: Attachment, device_label: Option<String>) -> AttachOutcome {
        self.destroy_deadline = None;

        let evicted = self.attachment.take().map(|old| {
            let stats = old.stats();
            tracing::debug!(
                session_id = %self.id,
                conn_id = %old.id(),
                sent = stats.messages_sent,
                dropped = stats.messages_dropped,
                "Evicting connection"
            );
            old.id().clone()
        });
        if let Some(label) = device_label {
            self.meta.device_label = Some(label);
        }

        let conn_id = attachment.id().clone();
        let replayed_bytes = self.bind(attachment);

        match &evicted {
            Some(old) => tracing::info!(
                session_id = %self.id,
                conn_id = %conn_id,
                evicted = %old,
                replayed_bytes,
                "Connection took over session"
            ),
            None => tracing::info!(
                session_id = %self.id,
                conn_id = %conn_id,
                replayed_bytes,
                "Connection reattached to session"
            ),
        }

        let _ = self.event_tx.send(SessionEvent::Attached {
            session_id: self.id.clone(),
            conn_id,
            evicted: evicted.clone(),
        });

        AttachOutcome {
            info: self.info(),
            replayed_bytes,
            evicted,
        }
    }

    /// Unbinds `conn_id` if it is still the current attachment.
    fn detach(&mut self, conn_id: &ConnectionId) -> bool {
        match &self.attachment {
            Some(current) if current.id() == conn_id => {}
            _ => {
                tracing::debug!(
                    session_id = %self.id,
                    conn_id = %conn_id,
                    "Ignoring detach from a connection that is no longer attached"
                );
                return false;
            }
        }

        let stats = self
            .attachment
            .take()
            .map(|attachment| attachment.stats())
            .unwrap_or_default();
        self.arm_destroy_timer();

        tracing::info!(
            session_id = %self.id,
            conn_id = %conn_id,
            sent = stats.messages_sent,
            dropped = stats.messages_dropped,
            keep_alive_secs = self.timings.keep_alive.as_secs(),
            "Connection detached, session kept alive"
        );

        let _ = self.event_tx.send(SessionEvent::Detached {
            session_id: self.id.clone(),
            conn_id: conn_id.clone(),
        });
        true
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidGeometry { cols, rows });
        }
        self.pty.resize(cols, rows)?;
        self.cols = cols;
        self.rows = rows;
        Ok(())
    }

    fn on_output(&mut self, bytes: &[u8]) {
        self.idle_deadline = Some(Instant::now() + self.timings.idle_timeout);

        let text = self.decoder.decode(bytes);
        if text.is_empty() {
            return;
        }
        self.forward(text);
    }

    /// Appends to scrollback and sends to the live connection, if any.
    fn forward(&mut self, text: String) {
        self.scrollback.push(&text);

        let closed = match self.attachment.as_mut() {
            Some(attachment) => {
                attachment.send(ServerMessage::output(self.id.clone(), text));
                attachment.is_closed()
            }
            None => false,
        };

        // A connection that vanished without detaching counts as detached.
        if closed {
            if let Some(conn_id) = self.attachment.as_ref().map(|a| a.id().clone()) {
                self.detach(&conn_id);
            }
        }
    }

    fn on_idle(&mut self) {
        self.idle_deadline = None;

        tracing::debug!(session_id = %self.id, "Session idle");
        let _ = self.event_tx.send(SessionEvent::Idle {
            session_id: self.id.clone(),
        });

        if let Some(attachment) = self.attachment.as_mut() {
            attachment.send(ServerMessage::SessionIdle {
                session_id: self.id.clone(),
            });
        }
    }

    fn arm_destroy_timer(&mut self) {
        self.destroy_deadline = Some(Instant::now() + self.timings.keep_alive);
    }

    fn created_message(&self) -> ServerMessage {
        ServerMessage::SessionCreated {
            session_id: self.id.clone(),
            cols: self.cols,
            rows: self.rows,
            cwd: Some(self.meta.cwd.display().to_string()),
            name: self.meta.name.clone(),
            created_at: Some(self.meta.created_at),
        }
    }

    fn teardown(mut self, reason: EndReason) {
        let tail = self.decoder.finish();
        if !tail.is_empty() {
            self.forward(tail);
        }

        let reason_text = reason.to_string();
        if let Some(attachment) = self.attachment.take() {
            attachment.finish(ServerMessage::SessionEnded {
                session_id: self.id.clone(),
                reason: reason_text.clone(),
            });
        }

        self.idle_deadline = None;
        self.destroy_deadline = None;
        self.pty.kill();
        self.scrollback.clear();
        self.registry.remove(&self.id);

        tracing::info!(session_id = %self.id, reason = %reason_text, "Session ended");

        let _ = self.event_tx.send(SessionEvent::Ended {
            session_id: self.id.clone(),
            reason: reason_text,
        });

        for reply in self.destroy_replies.drain(..) {
            let _ = reply.send(());
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
