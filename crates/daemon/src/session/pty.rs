//! PTY process wrapper.
//!
//! A [`PtyProcess`] owns one pseudo-terminal and the shell running on it.
//! Output and the final exit status arrive on a single [`PtyEvents`] stream
//! that lives as long as the process does.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};

use super::error::{SessionError, SessionId};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long to wait for trailing output once the process has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Parameters for spawning a shell on a new PTY.
#[derive(Debug, Clone)]
pub struct PtySpawnOptions {
    /// Shell binary to run.
    pub shell: String,
    /// Working directory; inherits the daemon's when `None`.
    pub cwd: Option<PathBuf>,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// How the shell process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the OS reported one.
    pub code: Option<u32>,
}

/// Events emitted by a PTY for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// Raw bytes read from the terminal.
    Output(Vec<u8>),
    /// The process exited. Always the last event.
    Exited(ProcessExit),
}

/// Receiving side of a PTY's event stream.
pub struct PtyEvents {
    rx: mpsc::UnboundedReceiver<PtyEvent>,
}

impl PtyEvents {
    /// Waits for the next event. Returns `None` after `Exited` was delivered.
    pub async fn recv(&mut self) -> Option<PtyEvent> {
        self.rx.recv().await
    }
}

/// A shell process running on a pseudo-terminal.
pub struct PtyProcess {
    /// Session this process belongs to, for logging.
    session_id: SessionId,

    /// The PTY master handle.
    master: Box<dyn MasterPty + Send>,

    /// Queue drained by the blocking writer task.
    input_tx: mpsc::UnboundedSender<Vec<u8>>,

    /// Handle used to terminate the child.
    killer: Box<dyn ChildKiller + Send + Sync>,

    /// Cleared once the process has exited or been killed.
    running: Arc<AtomicBool>,

    cols: u16,
    rows: u16,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns a shell on a fresh PTY.
    ///
    /// Must be called from within a tokio runtime: the reader, writer and
    /// exit waiter run on the blocking pool.
    pub fn spawn(
        session_id: &str,
        options: PtySpawnOptions,
    ) -> Result<(Self, PtyEvents), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        if let Some(ref dir) = options.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", "xterm-256color");
        cmd.env("TERMLINK_SESSION_ID", session_id);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", options.shell, e)))?;

        // The master must be the last holder of the terminal so reads hit EOF on exit.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = child.kill();
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let running = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        spawn_reader(session_id.to_string(), reader, data_tx);
        spawn_writer(session_id.to_string(), writer, input_rx);

        let waiter_running = Arc::clone(&running);
        let waiter_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    tracing::error!(session_id = %waiter_id, error = %e, "Failed to wait for shell");
                    None
                }
            };
            waiter_running.store(false, Ordering::SeqCst);
            let _ = exit_tx.send(ProcessExit { code });
        });

        tokio::spawn(merge_events(data_rx, exit_rx, event_tx));

        tracing::debug!(
            session_id = %session_id,
            shell = %options.shell,
            pid = ?pid,
            cols = options.cols,
            rows = options.rows,
            "Spawned PTY"
        );

        let process = PtyProcess {
            session_id: session_id.to_string(),
            master: pair.master,
            input_tx,
            killer,
            running,
            cols: options.cols,
            rows: options.rows,
            pid,
        };

        Ok((process, PtyEvents { rx: event_rx }))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the terminal size as the PTY reports it.
    pub fn size(&self) -> (u16, u16) {
        match self.master.get_size() {
            Ok(size) => (size.cols, size.rows),
            Err(_) => (self.cols, self.rows),
        }
    }

    /// Queues bytes for the shell's input. Never blocks.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.session_id.clone()));
        }

        self.input_tx
            .send(data.to_vec())
            .map_err(|_| SessionError::AlreadyTerminated(self.session_id.clone()))
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated(self.session_id.clone()));
        }

        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        self.cols = cols;
        self.rows = rows;

        tracing::debug!(
            session_id = %self.session_id,
            cols = cols,
            rows = rows,
            "Resized PTY"
        );

        Ok(())
    }

    /// Terminates the shell. Calling it again, or after the shell exited,
    /// does nothing.
    ///
    /// The exit itself is reported through [`PtyEvents`].
    pub fn kill(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.killer.kill() {
            tracing::debug!(
                session_id = %self.session_id,
                error = %e,
                "Kill failed, process probably already gone"
            );
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        self.kill();
    }
}

fn spawn_reader(
    session_id: SessionId,
    mut reader: Box<dyn Read + Send>,
    data_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::debug!(session_id = %session_id, "PTY EOF");
                    break;
                }
                Ok(n) => {
                    if data_tx.send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO once the shell side has closed.
                    tracing::debug!(session_id = %session_id, error = %e, "PTY read ended");
                    break;
                }
            }
        }
    });
}

fn spawn_writer(
    session_id: SessionId,
    mut writer: Box<dyn Write + Send>,
    mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
                tracing::warn!(session_id = %session_id, error = %e, "Error writing to PTY");
                break;
            }
        }
    });
}

/// Funnels output and exit into one ordered stream, so every byte the
/// shell wrote before exiting is delivered ahead of `Exited`.
async fn merge_events(
    mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut exit_rx: oneshot::Receiver<ProcessExit>,
    event_tx: mpsc::UnboundedSender<PtyEvent>,
) {
    let unknown = ProcessExit { code: None };

    let status = loop {
        tokio::select! {
            biased;
            data = data_rx.recv() => match data {
                Some(bytes) => {
                    let _ = event_tx.send(PtyEvent::Output(bytes));
                }
                None => break (&mut exit_rx).await.unwrap_or(unknown),
            },
            status = &mut exit_rx => {
                // Background jobs can keep the terminal open after the shell is gone.
                while let Ok(Some(bytes)) = tokio::time::timeout(EXIT_DRAIN_GRACE, data_rx.recv()).await {
                    let _ = event_tx.send(PtyEvent::Output(bytes));
                }
                break status.unwrap_or(unknown);
            }
        }
    };

    let _ = event_tx.send(PtyEvent::Exited(status));
}

/// Picks the shell to run.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh_options() -> PtySpawnOptions {
        PtySpawnOptions {
            shell: "/bin/sh".to_string(),
            cwd: None,
            cols: 80,
            rows: 24,
            env: vec![],
        }
    }

    /// Collects output until `marker` shows up or the events run dry.
    async fn wait_for_output(events: &mut PtyEvents, marker: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), events.recv()).await {
                Ok(Some(PtyEvent::Output(data))) => {
                    seen.push_str(&String::from_utf8_lossy(&data));
                    if seen.contains(marker) {
                        return true;
                    }
                }
                Ok(Some(PtyEvent::Exited(_))) | Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    async fn wait_for_exit(events: &mut PtyEvents) -> Option<ProcessExit> {
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), events.recv()).await {
                Ok(Some(PtyEvent::Exited(status))) => return Some(status),
                Ok(None) => return None,
                _ => {}
            }
        }
        None
    }

    #[test]
    fn test_detect_shell_with_provided() {
        let shell = detect_shell(Some("/bin/bash".to_string()));
        assert_eq!(shell, "/bin/bash");
    }

    #[test]
    fn test_detect_shell_ignores_empty() {
        let shell = detect_shell(Some(String::new()));
        assert!(!shell.is_empty());
    }

    #[tokio::test]
    async fn test_spawn() {
        let result = PtyProcess::spawn("test", sh_options());
        assert!(result.is_ok(), "Failed to spawn: {:?}", result.err());

        let (mut pty, _events) = result.unwrap();
        assert!(pty.is_running());
        assert!(pty.pid().is_some());
        assert_eq!(pty.size(), (80, 24));

        pty.kill();
    }

    #[tokio::test]
    async fn test_spawn_missing_shell_fails() {
        let mut options = sh_options();
        options.shell = "/nonexistent/shell-binary".to_string();

        let result = PtyProcess::spawn("test", options);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_write_produces_output() {
        let (mut pty, mut events) = PtyProcess::spawn("test", sh_options()).unwrap();

        pty.write(b"echo test_output_marker\n").unwrap();
        assert!(
            wait_for_output(&mut events, "test_output_marker").await,
            "Did not receive expected output"
        );

        pty.kill();
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = sh_options();
        options.cwd = Some(dir.path().to_path_buf());
        options.env = vec![("TEST_VAR".to_string(), "test_value".to_string())];

        let (mut pty, mut events) = PtyProcess::spawn("test", options).unwrap();
        pty.write(b"echo $TEST_VAR:$(pwd)\n").unwrap();

        let expected = format!("test_value:{}", dir.path().canonicalize().unwrap().display());
        assert!(wait_for_output(&mut events, &expected).await);

        pty.kill();
    }

    #[tokio::test]
    async fn test_resize_is_visible_to_shell() {
        let (mut pty, mut events) = PtyProcess::spawn("test", sh_options()).unwrap();

        pty.resize(100, 30).unwrap();
        assert_eq!(pty.size(), (100, 30));

        pty.write(b"stty size\n").unwrap();
        assert!(wait_for_output(&mut events, "30 100").await);

        pty.kill();
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let (pty, mut events) = PtyProcess::spawn("test", sh_options()).unwrap();

        pty.write(b"exit 42\n").unwrap();

        let status = wait_for_exit(&mut events).await;
        assert_eq!(status, Some(ProcessExit { code: Some(42) }));
        assert!(!pty.is_running());
    }

    #[tokio::test]
    async fn test_output_before_exit_is_delivered() {
        let (pty, mut events) = PtyProcess::spawn("test", sh_options()).unwrap();

        pty.write(b"echo last_words; exit 0\n").unwrap();

        let mut seen = String::new();
        let mut exited = false;
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), events.recv()).await {
                Ok(Some(PtyEvent::Output(data))) => {
                    assert!(!exited, "output after exit");
                    seen.push_str(&String::from_utf8_lossy(&data));
                }
                Ok(Some(PtyEvent::Exited(_))) => exited = true,
                Ok(None) => break,
                Err(_) => {}
            }
        }

        assert!(exited);
        assert!(seen.contains("last_words"));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (mut pty, mut events) = PtyProcess::spawn("test", sh_options()).unwrap();

        pty.kill();
        pty.kill();
        assert!(!pty.is_running());

        assert!(wait_for_exit(&mut events).await.is_some());
    }

    #[tokio::test]
    async fn test_write_and_resize_after_kill() {
        let (mut pty, _events) = PtyProcess::spawn("test", sh_options()).unwrap();

        pty.kill();

        assert!(matches!(
            pty.write(b"hello\n"),
            Err(SessionError::AlreadyTerminated(_))
        ));
        assert!(matches!(
            pty.resize(100, 50),
            Err(SessionError::AlreadyTerminated(_))
        ));
    }
}
