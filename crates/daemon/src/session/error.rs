//! Session error type.

use std::path::PathBuf;

use thiserror::Error;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found, or has already been destroyed.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process has already exited.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to open the PTY or start the shell.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// The requested working directory is outside the sandbox root.
    #[error("working directory is outside the allowed root: {}", .0.display())]
    SandboxViolation(PathBuf),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0} sessions)")]
    LimitReached(usize),

    /// Terminal geometry with a zero dimension.
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidGeometry {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },

    /// The PTY rejected a resize.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}
