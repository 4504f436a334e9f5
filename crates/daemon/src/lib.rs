//! # Termlink Daemon Library
//!
//! This crate hosts persistent shell sessions for Termlink clients.
//!
//! ## Overview
//!
//! A client connects over a WebSocket, gets a shell running in a PTY, and
//! may drop the connection at any time. The shell keeps running. When the
//! client comes back with the session id it left with, it first receives
//! the output it missed and then continues live.
//!
//! - **Sessions**: one task per shell owns the PTY, scrollback, timers,
//!   and the single attached connection
//! - **Gateway**: token or loopback authentication, then a JSON relay
//! - **Control socket**: local CLI commands over a Unix socket
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐   ┌───────────────────────────────┐    │
//! │  │ WebSocket Gateway│──▶│        Session Manager        │    │
//! │  └──────────────────┘   │  registry ─▶ session actors   │    │
//! │  ┌──────────────────┐   │            ─▶ PTY processes   │    │
//! │  │  Control Socket  │──▶└───────────────────────────────┘    │
//! │  └──────────────────┘                                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.ensure_token();
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and their lifecycle
//! - [`network`]: WebSocket gateway and per-connection relay
//! - [`ipc`]: Control socket shared by the daemon and the CLI
//! - [`sandbox`]: Working-directory confinement
//! - [`orchestrator`]: Main daemon coordinator

pub mod config;
pub mod ipc;
pub mod network;
pub mod orchestrator;
pub mod sandbox;
pub mod session;

pub use protocol;

pub use config::Config;

pub use session::{
    EndReason, SessionError, SessionEvent, SessionId, SessionInfo, SessionManager,
    SessionManagerImpl,
};

pub use network::{Authenticator, ConnectIntent, Gateway, GatewayError};

pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
