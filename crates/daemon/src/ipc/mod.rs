//! Local control channel between the CLI and a running daemon.
//!
//! Requests and responses travel as newline-delimited JSON over a Unix
//! socket that only the owning user can open.
//!
//! ## Socket path
//!
//! - `$XDG_RUNTIME_DIR/termlink/daemon.sock` when `XDG_RUNTIME_DIR` is set
//! - `/tmp/termlink-$UID/daemon.sock` otherwise
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&socket_path()).await?;
//!     let status = client.status().await?;
//!     println!("{} sessions", status.session_count);
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;
mod transport;

use std::path::PathBuf;

pub use client::IpcClient;
pub use messages::{DaemonStatus, IpcRequest, IpcResponse};
pub use pidfile::{pid_file_path, read_live_pid, PidFile};
pub use server::{IpcConnection, IpcServer};

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message too long ({0} bytes)")]
    LineTooLong(usize),

    /// The daemon answered with an error.
    #[error("{0}")]
    Daemon(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

pub fn socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("termlink").join("daemon.sock"),
        _ => PathBuf::from(format!("/tmp/termlink-{}", nix::unistd::getuid())).join("daemon.sock"),
    }
}
