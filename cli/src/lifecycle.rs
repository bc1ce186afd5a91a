//! PID-file ownership with stale-instance detection.
//!
//! A second daemon against the same data directory is refused while the
//! recorded process is alive; a stale file left by a crash (null signal
//! fails) is cleaned up and taken over.

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("another instance is running (pid {0})")]
    AlreadyRunning(i32),
    #[error("pid file io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Claims the PID file, verifying no other instance is live.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            if let Ok(pid) = raw.trim().parse::<i32>() {
                if process_alive(pid) {
                    return Err(PidFileError::AlreadyRunning(pid));
                }
                tracing::warn!(pid, "removing stale pid file");
            }
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, std::process::id().to_string())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("cannot remove pid file: {}", e);
            }
        }
    }
}

/// Null signal: true when the process exists (and we may signal it).
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        {
            let _pid = PidFile::acquire(&path).unwrap();
            let recorded: u32 = std::fs::read_to_string(&path)
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            assert_eq!(recorded, std::process::id());
        }
        assert!(!path.exists(), "pid file removed on drop");
    }

    #[test]
    fn live_pid_refuses_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // Our own pid is definitionally alive.
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        let err = PidFile::acquire(&path).unwrap_err();
        assert!(matches!(err, PidFileError::AlreadyRunning(_)));
    }

    #[test]
    fn stale_pid_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        // A pid far beyond pid_max cannot be alive.
        std::fs::write(&path, "999999999").unwrap();
        let _pid = PidFile::acquire(&path).unwrap();
        let recorded: u32 = std::fs::read_to_string(&path)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(recorded, std::process::id());
    }

    #[test]
    fn garbage_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(PidFile::acquire(&path).is_ok());
    }
}
