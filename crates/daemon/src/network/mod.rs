//! Network module for remote clients.
//!
//! Clients reach the daemon over a WebSocket. The [`gateway`] accepts and
//! authenticates them, [`handshake`] reads what they asked for, and
//! [`connection`] relays messages between the socket and a session.

pub mod auth;
mod connection;
pub mod gateway;
pub mod handshake;

use std::net::SocketAddr;

use thiserror::Error;

pub use auth::{AuthMethod, Authenticator};
pub use gateway::{Gateway, GatewayStats};
pub use handshake::ConnectIntent;

/// Errors raised while accepting a connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or wrong credential from a non-trusted peer.
    #[error("authentication rejected")]
    AuthRejected,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("WebSocket handshake timed out")]
    HandshakeTimeout,

    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
