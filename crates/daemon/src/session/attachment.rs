//! Per-attachment forwarding.
//!
//! An [`Attachment`] is the session's handle on the one connection currently
//! bound to it. It pushes messages into that connection's outbound queue
//! without ever blocking the session: when the queue is full the message is
//! dropped (the scrollback still has it), and when the connection is gone
//! the send is a no-op. The final message a session sends is the exception:
//! [`Attachment::finish`] waits for room instead of dropping it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use protocol::ServerMessage;
use tokio::sync::mpsc;

/// Unique identifier for a connection.
pub type ConnectionId = String;

/// Default capacity of a connection's outbound queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long a final message may wait for a full queue to make room.
pub const FINAL_SEND_TIMEOUT: Duration = Duration::from_secs(10);

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique connection id.
pub fn next_connection_id() -> ConnectionId {
    format!("conn-{}", NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
}

/// Statistics about an attachment's message handling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentStats {
    /// Total messages queued successfully.
    pub messages_sent: u64,
    /// Messages dropped because the connection was not keeping up.
    pub messages_dropped: u64,
    /// Whether the connection is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// Sender bound to a single connection.
pub struct Attachment {
    conn_id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    stats: AttachmentStats,
}

impl Attachment {
    /// Wraps an existing sender. The connection keeps its own clone so it
    /// can still reply after being evicted.
    pub fn new(conn_id: ConnectionId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            conn_id,
            tx,
            stats: AttachmentStats::default(),
        }
    }

    /// Creates an attachment together with the receiving end of its queue.
    pub fn channel(conn_id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(conn_id, tx), rx)
    }

    /// Returns the connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn stats(&self) -> AttachmentStats {
        self.stats.clone()
    }

    /// Returns whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queues a message without waiting.
    ///
    /// Returns true if the message was queued, false if dropped.
    pub fn send(&mut self, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                if self.stats.is_backpressured {
                    self.stats.is_backpressured = false;
                    tracing::debug!(
                        conn_id = %self.conn_id,
                        "Connection recovered from backpressure"
                    );
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                if !self.stats.is_backpressured {
                    self.stats.is_backpressured = true;
                    tracing::warn!(
                        conn_id = %self.conn_id,
                        dropped = self.stats.messages_dropped,
                        "Connection is backpressured, dropping messages"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(conn_id = %self.conn_id, "Connection channel closed");
                false
            }
        }
    }

    /// Sends the last message this connection will get from the session.
    ///
    /// A full queue does not drop it: delivery continues on a background
    /// task until there is room or [`FINAL_SEND_TIMEOUT`] passes. Must be
    /// called from within a tokio runtime.
    pub fn finish(self, message: ServerMessage) {
        let Self { conn_id, tx, .. } = self;

        let message = match tx.try_send(message) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!(conn_id = %conn_id, "Connection channel closed");
                return;
            }
            Err(mpsc::error::TrySendError::Full(message)) => message,
        };

        tracing::debug!(conn_id = %conn_id, "Queue full, waiting to deliver final message");
        tokio::spawn(async move {
            if let Err(e) = tx.send_timeout(message, FINAL_SEND_TIMEOUT).await {
                tracing::warn!(conn_id = %conn_id, error = %e, "Final message not delivered");
            }
        });
    }
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("conn_id", &self.conn_id)
            .field("stats", &self.stats)
            .finish()
    }
}
