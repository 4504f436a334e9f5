//! PID file used to detect an already-running daemon.
//!
//! The file lives at `<data_dir>/daemon.pid`. A file naming a dead process
//! is stale and gets removed when read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

pub const PID_FILE_NAME: &str = "daemon.pid";

pub fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Returns the pid recorded at `path` if that process is still alive.
pub fn read_live_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    match contents.trim().parse::<u32>() {
        Ok(pid) if is_process_running(pid) => Some(pid),
        _ => {
            tracing::debug!(path = %path.display(), "Removing stale PID file");
            let _ = fs::remove_file(path);
            None
        }
    }
}

/// Signal 0 probes for existence; EPERM still means the process exists.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Holds the PID file for the life of the daemon and removes it on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current pid to `path`, failing if another live daemon
    /// already owns it.
    pub fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(pid) = read_live_pid(path) {
            if pid != std::process::id() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("daemon already running with PID {pid}"),
                ));
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", std::process::id()))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
