//! Message definitions for the session channel.
//!
//! Every WebSocket text frame carries exactly one JSON object tagged by its
//! `type` field. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Columns used when a client does not ask for a size.
pub const DEFAULT_COLS: u16 = 80;

/// Rows used when a client does not ask for a size.
pub const DEFAULT_ROWS: u16 = 24;

/// Message types a client may send.
const CLIENT_TYPES: &[&str] = &["input", "resize", "close", "ping"];

/// Messages sent from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Raw keystrokes for the session's shell.
    #[serde(rename = "input", rename_all = "camelCase")]
    Input { session_id: String, data: String },

    /// Terminal geometry change.
    #[serde(rename = "resize", rename_all = "camelCase")]
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    /// Ask the daemon to end the session for good.
    #[serde(rename = "close", rename_all = "camelCase")]
    Close { session_id: String },

    /// Keepalive.
    #[serde(rename = "ping")]
    Ping,
}

impl ClientMessage {
    /// Parses and validates one text frame.
    ///
    /// Anything that is not a well-formed, known client message is rejected
    /// with a [`ProtocolError`] describing the problem.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let kind = match &value {
            Value::Object(map) => match map.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                _ => return Err(ProtocolError::MissingType),
            },
            _ => {
                return Err(ProtocolError::InvalidJson(
                    "expected a JSON object".to_string(),
                ))
            }
        };

        if !CLIENT_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        let message: ClientMessage =
            serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage {
                kind: kind.clone(),
                reason: e.to_string(),
            })?;

        if let ClientMessage::Resize { cols, rows, .. } = &message {
            validate_geometry(*cols, *rows)?;
        }

        Ok(message)
    }

    /// Returns the session this message targets, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Input { session_id, .. }
            | ClientMessage::Resize { session_id, .. }
            | ClientMessage::Close { session_id } => Some(session_id),
            ClientMessage::Ping => None,
        }
    }

    /// Serializes the message to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// Checks that a terminal size is usable.
pub fn validate_geometry(cols: u16, rows: u16) -> Result<()> {
    if cols == 0 || rows == 0 {
        return Err(ProtocolError::InvalidGeometry { cols, rows });
    }
    Ok(())
}

/// Messages sent from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A chunk of terminal output, or the scrollback replay on reattach.
    #[serde(rename = "output", rename_all = "camelCase")]
    Output { session_id: String, data: String },

    /// Sent once per attach, new or resumed.
    #[serde(rename = "session.created", rename_all = "camelCase")]
    SessionCreated {
        session_id: String,
        cols: u16,
        rows: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_at: Option<u64>,
    },

    /// The session is gone; the id must not be reused.
    #[serde(rename = "session.ended", rename_all = "camelCase")]
    SessionEnded { session_id: String, reason: String },

    /// The shell has been quiet for the idle period.
    #[serde(rename = "session.idle", rename_all = "camelCase")]
    SessionIdle { session_id: String },

    /// Keepalive reply.
    #[serde(rename = "pong")]
    Pong,

    /// A request could not be processed.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    /// Builds an `error` message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Builds an `output` message.
    pub fn output(session_id: impl Into<String>, data: impl Into<String>) -> Self {
        ServerMessage::Output {
            session_id: session_id.into(),
            data: data.into(),
        }
    }

    /// Whether the connection should close after delivering this message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerMessage::SessionEnded { .. })
    }

    /// Serializes the message to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parses a daemon message. Used by clients and tests.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}
