//! Termlink Daemon
//!
//! Hosts persistent shell sessions that remote clients attach to over a
//! WebSocket.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, generate_token, Config};
use daemon::ipc::{pid_file_path, read_live_pid, socket_path, IpcClient, PidFile};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::session::SessionInfo;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Termlink Daemon - persistent shell sessions for remote clients.
#[derive(Parser, Debug)]
#[command(name = "termlink-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon in the foreground
    Start,

    /// Stop the running daemon
    Stop {
        /// Kill immediately with SIGKILL
        #[arg(long, short)]
        force: bool,

        /// Seconds to wait for a graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Inspect and end sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Manage the access token
    #[command(subcommand)]
    Token(TokenCommands),
}

#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List live sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// End a session
    Kill {
        /// Session ID to end
        session_id: String,
    },

    /// Print the shell process ids the daemon owns
    Pids,
}

#[derive(Subcommand, Debug, Clone)]
pub enum TokenCommands {
    /// Print the configured token
    Show,

    /// Replace the token with a freshly generated one
    Rotate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!(path = %config_path.display(), "Loaded configuration");

    match cli.command {
        Commands::Start => run_daemon(config, &config_path).await,
        Commands::Stop { force, timeout } => {
            let pid_path = pid_file_path(&config.daemon.data_dir);
            if force {
                force_stop_daemon(&pid_path)
            } else {
                graceful_stop_daemon(&pid_path, Duration::from_secs(timeout)).await
            }
        }
        Commands::Status => {
            let status = connect().await?.status().await?;
            println!("Daemon Status: running (PID {})", status.pid);
            println!("  Listening:   {}", status.listen_addr);
            println!("  Uptime:      {}", format_duration(status.uptime_secs));
            println!("  Sessions:    {}", status.session_count);
            println!("  Connections: {}", status.connection_count);
            Ok(())
        }
        Commands::Sessions(cmd) => {
            let mut client = connect().await?;
            match cmd {
                SessionsCommands::List { json } => {
                    let sessions = client.list_sessions().await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&sessions)?);
                    } else {
                        print_sessions_table(&sessions);
                    }
                }
                SessionsCommands::Kill { session_id } => {
                    client
                        .kill_session(&session_id)
                        .await
                        .with_context(|| format!("Failed to end session {session_id}"))?;
                    println!("Session {session_id} ended");
                }
                SessionsCommands::Pids => {
                    for pid in client.managed_pids().await? {
                        println!("{pid}");
                    }
                }
            }
            Ok(())
        }
        Commands::Token(TokenCommands::Show) => {
            if config.security.token.is_empty() {
                anyhow::bail!("No token configured yet; one is generated on first start");
            }
            println!("{}", config.security.token);
            Ok(())
        }
        Commands::Token(TokenCommands::Rotate) => {
            // Rotate the stored token, not an env override.
            let mut stored = Config::load(&config_path)?;
            stored.security.token = generate_token();
            stored.save(&config_path)?;
            println!("{}", stored.security.token);
            eprintln!("Restart the daemon for the new token to take effect.");
            Ok(())
        }
    }
}

/// Installs the global subscriber. The returned guard flushes the log file
/// and must live until exit.
fn init_tracing(
    config: &Config,
    verbose: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.daemon.log_level.to_lowercase())
    };

    let (file_layer, guard) = match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "termlink-daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn run_daemon(mut config: Config, config_path: &Path) -> Result<()> {
    config.validate()?;

    let pid_path = pid_file_path(&config.daemon.data_dir);
    if let Some(pid) = read_live_pid(&pid_path) {
        eprintln!("Error: Daemon already running (PID: {pid})");
        eprintln!();
        eprintln!("To stop the existing daemon, run:");
        eprintln!("  termlink-daemon stop");
        std::process::exit(1);
    }

    if config.ensure_token() {
        let mut stored = Config::load(config_path)?;
        stored.security.token = config.security.token.clone();
        stored
            .save(config_path)
            .context("Failed to persist generated token")?;
        tracing::info!(
            path = %config_path.display(),
            "Generated an access token; print it with `termlink-daemon token show`"
        );
    }

    let _pid_file = PidFile::acquire(&pid_path)
        .with_context(|| format!("Failed to write PID file {}", pid_path.display()))?;

    let mut orchestrator = DaemonOrchestrator::new(config)?;
    let mut events = orchestrator.subscribe();
    orchestrator.start().await?;

    if let Some(addr) = orchestrator.listen_addr() {
        tracing::info!(%addr, "Termlink daemon ready");
    }

    let stop_requested = async {
        loop {
            match events.recv().await {
                Ok(OrchestratorEvent::StopRequested) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = stop_requested => tracing::info!("Shutting down on request"),
    }

    orchestrator.stop().await
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = sigint.recv() => tracing::info!("Received SIGINT"),
    }
    Ok(())
}

async fn connect() -> Result<IpcClient> {
    IpcClient::connect(&socket_path())
        .await
        .context("Daemon is not running (cannot connect to control socket)")
}

async fn graceful_stop_daemon(pid_path: &Path, timeout: Duration) -> Result<()> {
    connect().await?.stop().await?;
    println!("Shutdown acknowledged, waiting for daemon to exit...");

    let started = Instant::now();
    while started.elapsed() < timeout {
        if read_live_pid(pid_path).is_none() {
            println!("Daemon stopped");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!(
        "Timed out waiting for daemon to exit ({}s); try `termlink-daemon stop --force`",
        timeout.as_secs()
    )
}

fn force_stop_daemon(pid_path: &Path) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = read_live_pid(pid_path).context("Daemon is not running (no live PID file)")?;
    let raw = i32::try_from(pid).context("PID out of range")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {pid})"))?;
    println!("Sent SIGKILL to daemon (PID {pid})");

    let _ = std::fs::remove_file(pid_path);
    let _ = std::fs::remove_file(socket_path());
    Ok(())
}

fn print_sessions_table(sessions: &[SessionInfo]) {
    if sessions.is_empty() {
        println!("No active sessions.");
        return;
    }

    let id_width = sessions.iter().map(|s| s.id.len()).max().unwrap_or(8).max(8);

    println!(
        "{:<id_width$}  {:>7}  {:>9}  {:<8}  {:<16}  CWD",
        "ID", "PID", "SIZE", "STATE", "NAME"
    );
    println!("{}", "-".repeat(id_width + 52));

    for session in sessions {
        let pid = session
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let size = format!("{}x{}", session.cols, session.rows);
        let state = if session.has_live_connection {
            "attached"
        } else {
            "detached"
        };
        let name = truncate_str(session.name.as_deref().unwrap_or("-"), 16);

        println!(
            "{:<id_width$}  {:>7}  {:>9}  {:<8}  {:<16}  {}",
            session.id, pid, size, state, name, session.cwd
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["termlink-daemon", "start"]).unwrap();
        assert!(matches!(cli.command, Commands::Start));
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_stop_defaults() {
        let cli = Cli::try_parse_from(["termlink-daemon", "stop"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(!force);
                assert_eq!(timeout, 30);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_stop_with_force_and_timeout() {
        let cli =
            Cli::try_parse_from(["termlink-daemon", "stop", "-f", "--timeout", "5"]).unwrap();
        match cli.command {
            Commands::Stop { force, timeout } => {
                assert!(force);
                assert_eq!(timeout, 5);
            }
            _ => panic!("Expected Stop command"),
        }
    }

    #[test]
    fn test_status_command() {
        let cli = Cli::try_parse_from(["termlink-daemon", "status"]).unwrap();
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_sessions_commands() {
        let cli = Cli::try_parse_from(["termlink-daemon", "sessions", "list", "--json"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sessions(SessionsCommands::List { json: true })
        ));

        let cli = Cli::try_parse_from(["termlink-daemon", "sessions", "kill", "abc"]).unwrap();
        match cli.command {
            Commands::Sessions(SessionsCommands::Kill { session_id }) => {
                assert_eq!(session_id, "abc")
            }
            _ => panic!("Expected Sessions Kill command"),
        }

        let cli = Cli::try_parse_from(["termlink-daemon", "sessions", "pids"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sessions(SessionsCommands::Pids)
        ));
    }

    #[test]
    fn test_token_commands() {
        let cli = Cli::try_parse_from(["termlink-daemon", "token", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Token(TokenCommands::Show)));

        let cli = Cli::try_parse_from(["termlink-daemon", "token", "rotate"]).unwrap();
        assert!(matches!(cli.command, Commands::Token(TokenCommands::Rotate)));
    }

    #[test]
    fn test_global_flags_after_command() {
        let cli = Cli::try_parse_from([
            "termlink-daemon",
            "status",
            "--verbose",
            "--config",
            "/etc/termlink.toml",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/termlink.toml")));
    }

    #[test]
    fn test_invalid_invocations() {
        assert!(Cli::try_parse_from(["termlink-daemon"]).is_err());
        assert!(Cli::try_parse_from(["termlink-daemon", "sessions"]).is_err());
        assert!(Cli::try_parse_from(["termlink-daemon", "sessions", "kill"]).is_err());
        assert!(Cli::try_parse_from(["termlink-daemon", "token", "print"]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(65), "1m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }

    #[test]
    fn test_truncate_str() {
        assert_eq!(truncate_str("short", 16), "short");
        assert_eq!(truncate_str("a-very-long-session-name", 10), "a-very-...");
        assert_eq!(truncate_str("ééééééé", 5), "éé...");
    }
}
