//! Session lifecycle events and end reasons.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::attachment::ConnectionId;
use super::error::SessionId;

/// Why a session was destroyed. The display form is the `reason` sent to
/// clients in `session.ended`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The shell exited on its own or was killed.
    ProcessExited {
        /// Exit code, if known.
        code: Option<u32>,
    },
    /// Nobody reattached within the keep-alive window.
    Expired {
        /// The keep-alive window that elapsed.
        after: Duration,
    },
    /// Explicit close from a client or an operator.
    ClosedByUser,
    /// The daemon is stopping.
    Shutdown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::ProcessExited { code: Some(code) } => {
                write!(f, "process exited (code {})", code)
            }
            EndReason::ProcessExited { code: None } => write!(f, "process exited"),
            EndReason::Expired { after } => write!(
                f,
                "session expired after {} without a connection",
                format_window(*after)
            ),
            EndReason::ClosedByUser => write!(f, "closed by user"),
            EndReason::Shutdown => write!(f, "daemon shutting down"),
        }
    }
}

fn format_window(window: Duration) -> String {
    let secs = window.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        if minutes == 1 {
            "1 minute".to_string()
        } else {
            format!("{} minutes", minutes)
        }
    } else if secs == 1 {
        "1 second".to_string()
    } else if secs == 0 {
        format!("{} ms", window.as_millis())
    } else {
        format!("{} seconds", secs)
    }
}

/// Lifecycle notifications for collaborators such as a push notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session was spawned and bound to its first connection.
    Created {
        session_id: SessionId,
        pid: Option<u32>,
    },
    /// A connection attached to an existing session.
    Attached {
        session_id: SessionId,
        conn_id: ConnectionId,
        /// The connection that lost the session, if one was attached.
        evicted: Option<ConnectionId>,
    },
    /// The attached connection went away; the destroy timer is running.
    Detached {
        session_id: SessionId,
        conn_id: ConnectionId,
    },
    /// The shell has been quiet for the idle period.
    Idle { session_id: SessionId },
    /// The session is gone.
    Ended {
        session_id: SessionId,
        reason: String,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Created { session_id, .. }
            | SessionEvent::Attached { session_id, .. }
            | SessionEvent::Detached { session_id, .. }
            | SessionEvent::Idle { session_id }
            | SessionEvent::Ended { session_id, .. } => session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_messages() {
        assert_eq!(
            EndReason::ProcessExited { code: Some(0) }.to_string(),
            "process exited (code 0)"
        );
        assert_eq!(
            EndReason::ProcessExited { code: None }.to_string(),
            "process exited"
        );
        assert_eq!(EndReason::ClosedByUser.to_string(), "closed by user");
        assert_eq!(EndReason::Shutdown.to_string(), "daemon shutting down");
    }

    #[test]
    fn test_expired_message() {
        let reason = EndReason::Expired {
            after: Duration::from_secs(30 * 60),
        };
        assert_eq!(
            reason.to_string(),
            "session expired after 30 minutes without a connection"
        );

        let reason = EndReason::Expired {
            after: Duration::from_secs(60),
        };
        assert_eq!(
            reason.to_string(),
            "session expired after 1 minute without a connection"
        );

        let reason = EndReason::Expired {
            after: Duration::from_secs(90),
        };
        assert_eq!(
            reason.to_string(),
            "session expired after 90 seconds without a connection"
        );
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::Idle {
            session_id: "s1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"idle","session_id":"s1"}"#);
        assert_eq!(event.session_id(), "s1");
    }
}
