//! Pid file written at startup and removed on exit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const PID_FILE: &str = "netwarden.pid";

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Record this process id at `path`, replacing a stale file.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(previous) = read_pid(&path) {
            if previous != std::process::id() && is_alive(previous) {
                tracing::warn!(pid = previous, path = %path.display(), "another instance appears to be running");
            }
        }
        fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to remove pid file"),
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks that the process exists and may be signalled.
    unsafe { libc::kill(pid, 0) == 0 }
}
