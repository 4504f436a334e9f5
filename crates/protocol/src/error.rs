//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way a frame can be rejected.
///
/// None of these are fatal to a connection: the relay answers with an
/// `error` message and keeps reading.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame is not valid JSON, or not a JSON object.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The object has no string `type` field.
    #[error("message is missing a string \"type\" field")]
    MissingType,

    /// The `type` field names a message this side does not accept.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// A known message type with missing or wrongly-typed fields.
    #[error("invalid {kind} message: {reason}")]
    InvalidMessage {
        /// The message type that failed validation.
        kind: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Terminal geometry outside the accepted range.
    #[error("invalid terminal size {cols}x{rows}: columns and rows must be at least 1")]
    InvalidGeometry {
        /// Requested columns.
        cols: u16,
        /// Requested rows.
        rows: u16,
    },

    /// The frame was not a text frame.
    #[error("unsupported frame: {0}")]
    UnsupportedFrame(String),

    /// Failed to serialize an outgoing message.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_eof() {
            ProtocolError::InvalidJson(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_json_display() {
        let err = ProtocolError::InvalidJson("expected value at line 1 column 1".to_string());
        assert_eq!(
            err.to_string(),
            "invalid JSON: expected value at line 1 column 1"
        );
    }

    #[test]
    fn test_unknown_type_display() {
        let err = ProtocolError::UnknownType("launch".to_string());
        assert_eq!(err.to_string(), "unknown message type: launch");
    }

    #[test]
    fn test_invalid_message_display() {
        let err = ProtocolError::InvalidMessage {
            kind: "resize".to_string(),
            reason: "missing field `cols`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid resize message: missing field `cols`"
        );
    }

    #[test]
    fn test_invalid_geometry_display() {
        let err = ProtocolError::InvalidGeometry { cols: 0, rows: 24 };
        assert!(err.to_string().contains("0x24"));
    }

    #[test]
    fn test_from_serde_json_syntax_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
