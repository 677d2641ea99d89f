//! Child process ownership: spawn, liveness, bounded termination.

use log::{debug, warn};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} started without a pid")]
    NoPid { command: String },
}

/// A supervised child process.
///
/// On Unix the child is placed in its own process group so termination
/// reaches any grandchildren it spawned; a leaked grandchild would keep our
/// local port bound and wedge every restart of that service.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    terminated: bool,
}

impl ProcessHandle {
    pub fn spawn(mut cmd: Command, label: &str) -> Result<Self, SpawnError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| SpawnError::Launch {
            command: label.to_string(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SpawnError::NoPid {
            command: label.to_string(),
        })?;

        debug!("spawned {} (pid {})", label, pid);
        Ok(Self {
            child,
            pid,
            terminated: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Liveness check that does not reap: a null signal on Unix, a handle
    /// query elsewhere. The child stays ours to collect in `terminate`.
    pub fn alive(&mut self) -> bool {
        #[cfg(unix)]
        {
            unsafe { libc::kill(self.pid as i32, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            match self.child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    warn!("liveness query for pid {} failed: {}", self.pid, err);
                    false
                }
            }
        }
    }

    /// Requests termination of the whole process group, waits up to `grace`,
    /// then force-kills. Safe to call more than once.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        #[cfg(unix)]
        {
            unsafe {
                libc::killpg(self.pid as i32, libc::SIGTERM);
            }
            if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
                warn!("pid {} ignored SIGTERM, force killing", self.pid);
                unsafe {
                    libc::killpg(self.pid as i32, libc::SIGKILL);
                }
                let _ = self.child.wait().await;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
            let _ = tokio::time::timeout(grace, self.child.wait()).await;
        }

        debug!("terminated pid {}", self.pid);
    }
}

/// Seam between the supervisor and the processes it owns; mocks stand in
/// for real children in tests.
#[async_trait::async_trait]
pub trait ChildHandle: Send + Sync {
    fn pid(&self) -> u32;
    fn alive(&mut self) -> bool;
    async fn terminate(&mut self, grace: Duration);
}

#[async_trait::async_trait]
impl ChildHandle for ProcessHandle {
    fn pid(&self) -> u32 {
        ProcessHandle::pid(self)
    }

    fn alive(&mut self) -> bool {
        ProcessHandle::alive(self)
    }

    async fn terminate(&mut self, grace: Duration) {
        ProcessHandle::terminate(self, grace).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn sleep_cmd(seconds: u32) -> Command {
        let mut cmd = Command::new("sleep");
        cmd.arg(seconds.to_string());
        cmd
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_child_is_alive_until_terminated() {
        let mut handle = ProcessHandle::spawn(sleep_cmd(30), "sleep").unwrap();
        assert!(handle.pid() > 0);
        assert!(handle.alive());

        handle.terminate(Duration::from_secs(2)).await;
        assert!(!handle.alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_is_idempotent() {
        let mut handle = ProcessHandle::spawn(sleep_cmd(30), "sleep").unwrap();
        handle.terminate(Duration::from_secs(2)).await;
        handle.terminate(Duration::from_secs(2)).await;
        assert!(!handle.alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_child_reports_dead_once_reaped() {
        let mut handle = ProcessHandle::spawn(sleep_cmd(0), "sleep").unwrap();
        // Give the child a moment to exit on its own. The null signal still
        // reaches the unreaped child; terminate collects it.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.terminate(Duration::from_secs(2)).await;
        assert!(!handle.alive());
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let cmd = Command::new("kportforward-test-no-such-binary");
        let err = ProcessHandle::spawn(cmd, "missing").unwrap_err();
        assert!(matches!(err, SpawnError::Launch { .. }));
    }
}
