//! # Termlink Protocol Library
//!
//! Message definitions shared by the Termlink daemon and its clients.
//!
//! ## Overview
//!
//! A client talks to the daemon over one WebSocket per shell session. Each
//! text frame carries a single JSON object tagged by `type`:
//!
//! ```text
//! client → daemon   input, resize, close, ping
//! daemon → client   output, session.created, session.ended, session.idle,
//!                   pong, error
//! ```
//!
//! Incoming frames go through [`ClientMessage::parse`], which rejects
//! malformed JSON, unknown types and missing or mistyped fields with a
//! [`ProtocolError`]. The daemon reports those back as an `error` message
//! and keeps the connection open.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, ServerMessage};
//!
//! let msg = ClientMessage::parse(r#"{"type":"input","sessionId":"s1","data":"ls\n"}"#).unwrap();
//! assert_eq!(msg.session_id(), Some("s1"));
//!
//! let reply = ServerMessage::output("s1", "file.txt\r\n");
//! let json = reply.to_json().unwrap();
//! assert!(json.contains(r#""type":"output""#));
//! ```

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    validate_geometry, ClientMessage, ServerMessage, DEFAULT_COLS, DEFAULT_ROWS,
};
