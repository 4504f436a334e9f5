//! Control-socket message types.
//!
//! Each request and response is one JSON value on its own line.

use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

/// Requests sent by the CLI to a running daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IpcRequest {
    /// Liveness probe.
    Ping,
    Status,
    /// Graceful shutdown; every session ends with a shutdown notice.
    Stop,
    ListSessions,
    /// Ends a session as if its user had closed it.
    KillSession { session_id: String },
    /// Shell process ids owned by the daemon.
    ManagedPids,
}

/// Snapshot returned for [`IpcRequest::Status`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatus {
    pub pid: u32,
    pub uptime_secs: u64,
    pub listen_addr: String,
    pub session_count: usize,
    pub connection_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IpcResponse {
    Pong,
    Status(DaemonStatus),
    Stopping,
    Sessions { sessions: Vec<SessionInfo> },
    SessionKilled { session_id: String },
    Pids { pids: Vec<u32> },
    Error { message: String },
}

impl IpcResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
