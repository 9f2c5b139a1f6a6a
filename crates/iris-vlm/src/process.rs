//! The VLM server child process: spawn, liveness, and graceful stop.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use iris_types::{IrisError, ModelProfileConfig, VlmConfig};

/// Build the llama-server argument vector for a profile.
///
/// Pure so the launch contract is pinned by tests. Relative weight paths
/// must already be resolved by the caller.
pub fn build_server_args(
    profile: &ModelProfileConfig,
    model_file: &Path,
    mmproj_file: &Path,
    host: &str,
    port: u16,
) -> Vec<String> {
    vec![
        "-m".into(),
        model_file.display().to_string(),
        "--mmproj".into(),
        mmproj_file.display().to_string(),
        "-ngl".into(),
        profile.gpu_layers.to_string(),
        "-c".into(),
        profile.context_size.to_string(),
        "--host".into(),
        host.into(),
        "--port".into(),
        port.to_string(),
    ]
}

/// Locate the server executable: explicit config path, then `PATH`.
pub fn server_executable(config: &VlmConfig) -> PathBuf {
    config
        .executable
        .clone()
        .unwrap_or_else(|| PathBuf::from("llama-server"))
}

/// A running VLM server child.
pub struct VlmProcess {
    child: Child,
    pid: u32,
    pub started_at: Instant,
}

impl VlmProcess {
    /// Spawn the server for a profile, appending its output to `log_path`.
    pub fn spawn(
        config: &VlmConfig,
        profile: &ModelProfileConfig,
        model_file: &Path,
        mmproj_file: &Path,
        log_path: &Path,
    ) -> Result<Self, IrisError> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log_file.try_clone()?;

        let executable = server_executable(config);
        let args = build_server_args(profile, model_file, mmproj_file, &config.host, config.port);

        let mut child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                IrisError::VlmUnreachable(format!(
                    "failed to spawn {}: {e}",
                    executable.display()
                ))
            })?;

        let pid = child.id().ok_or_else(|| {
            IrisError::VlmUnreachable("server exited before pid was available".into())
        })?;

        // A pid of 0 would mean the child already reaped; treat as spawn failure.
        if pid == 0 {
            let _ = child.start_kill();
            return Err(IrisError::VlmUnreachable("server died at spawn".into()));
        }

        info!(pid, executable = %executable.display(), "vlm server spawned");
        Ok(Self {
            child,
            pid,
            started_at: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness check. `Some(code)` once the child has exited.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "try_wait failed, treating child as dead");
                Some(-1)
            }
        }
    }

    /// SIGTERM, wait for the grace window, then SIGKILL.
    pub async fn terminate(mut self, grace: Duration) -> Option<i32> {
        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!(pid = self.pid, error = %e, "SIGTERM failed, killing");
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(pid = self.pid, code = ?status.code(), "vlm server exited");
                return status.code();
            }
            Ok(Err(e)) => {
                warn!(pid = self.pid, error = %e, "wait failed after SIGTERM");
            }
            Err(_) => {
                warn!(pid = self.pid, grace_secs = grace.as_secs(), "grace window elapsed, escalating to SIGKILL");
            }
        }

        let _ = self.child.start_kill();
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(_) => None,
        }
    }
}
