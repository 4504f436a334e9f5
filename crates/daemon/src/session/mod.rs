//! Session management module.
//!
//! This module provides PTY spawning and session lifecycle management.
//! Each session is owned by its own task; connections attach to it,
//! detach from it, and reattach later to find their scrollback waiting.

mod actor;
pub mod attachment;
pub mod error;
pub mod event;
pub mod manager;
pub mod output;
pub mod pty;
pub mod registry;
pub mod scrollback;

pub use attachment::{
    next_connection_id, Attachment, AttachmentStats, ConnectionId, DEFAULT_CHANNEL_CAPACITY,
};
pub use error::{SessionError, SessionId};
pub use event::{EndReason, SessionEvent};
pub use manager::{
    now_millis, AttachedSession, CreateSessionRequest, SessionInfo, SessionManager,
    SessionManagerImpl, SessionSettings,
};
pub use pty::{PtyEvent, PtyEvents, PtyProcess, PtySpawnOptions};
pub use registry::SessionRegistry;
