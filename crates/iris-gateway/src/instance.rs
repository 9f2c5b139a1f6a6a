//! Single-instance enforcement via a pid-bearing lock file.
//!
//! One supervisor per host: the lock file records the owning pid, and a
//! stale lock (dead pid, empty file) is reclaimed rather than treated as a
//! live instance.

use std::path::PathBuf;

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{info, warn};

use iris_types::IrisError;

/// Advisory single-instance lock. Released (and the file removed) on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    owned: bool,
}

impl InstanceLock {
    /// Acquire the lock, reclaiming stale files from dead processes.
    ///
    /// Returns `Blocked` when another live supervisor holds it.
    pub fn acquire(path: PathBuf) -> Result<Self, IrisError> {
        if let Some(existing_pid) = read_pid(&path) {
            if process_alive(existing_pid) {
                return Err(IrisError::Blocked(format!(
                    "another instance is already running (pid {existing_pid})"
                )));
            }
            warn!(stale_pid = existing_pid, "removing stale instance lock");
            let _ = std::fs::remove_file(&path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        info!(path = %path.display(), pid = std::process::id(), "instance lock acquired");
        Ok(Self { path, owned: true })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn read_pid(path: &std::path::Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse().ok()
}

/// Signal-0 liveness probe.
fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("iris.lock");

        {
            let _lock = InstanceLock::acquire(path.clone()).unwrap();
            let recorded = read_pid(&path).unwrap();
            assert_eq!(recorded as u32, std::process::id());
        }
        assert!(!path.exists(), "lock file removed on drop");
    }

    #[test]
    fn second_acquire_from_live_pid_is_blocked() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("iris.lock");

        let _lock = InstanceLock::acquire(path.clone()).unwrap();
        match InstanceLock::acquire(path) {
            Err(IrisError::Blocked(msg)) => assert!(msg.contains("already running")),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("iris.lock");
        // A pid that cannot be alive (pid_max is far below this).
        std::fs::write(&path, "999999999").unwrap();

        let lock = InstanceLock::acquire(path.clone());
        assert!(lock.is_ok(), "stale lock should be reclaimed");
    }

    #[test]
    fn garbage_lock_content_is_treated_as_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("iris.lock");
        std::fs::write(&path, "not a pid").unwrap();
        assert!(InstanceLock::acquire(path).is_ok());
    }
}
