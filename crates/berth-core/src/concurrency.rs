use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Exclusive lock marking the single agent that owns a container root.
///
/// Reconciliation destroys every container following the naming convention,
/// so a second agent on the same root would tear down the first one's
/// containers. The lock is released when dropped or when the process dies.
#[derive(Debug)]
pub struct AgentLock {
    lock_file: File,
    path: PathBuf,
}

impl AgentLock {
    /// Take the lock, failing at once if another agent holds it. The parent
    /// directory must already exist.
    pub fn try_acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("acquired agent lock {}", lock_path.display());
                Ok(Self {
                    lock_file: file,
                    path: lock_path.to_path_buf(),
                })
            }
            Err(_) => Err(CoreError::AgentLocked(lock_path.to_path_buf())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AgentLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Route SIGINT and SIGTERM to [`shutdown_requested`]. A second signal
/// exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, stopping agent...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Ask the agent loop to stop, as a signal would.
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".berth-agent.lock");

        let lock = AgentLock::try_acquire(&lock_path).unwrap();
        assert_eq!(lock.path(), lock_path);
        assert!(matches!(
            AgentLock::try_acquire(&lock_path),
            Err(CoreError::AgentLocked(_))
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join(".berth-agent.lock");
        {
            let _lock = AgentLock::try_acquire(&lock_path).unwrap();
        }
        assert!(AgentLock::try_acquire(&lock_path).is_ok());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AgentLock::try_acquire(&dir.path().join("absent/.berth-agent.lock")),
            Err(CoreError::Io(_))
        ));
    }
}
