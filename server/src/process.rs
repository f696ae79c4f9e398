//! Lifecycle of a single external game process
//!
//! A [`GameProcess`] owns at most one child process. The child is started
//! with detached stdio, checked for liveness against the OS on every query,
//! and stopped gracefully first (SIGTERM on unix) before being killed.
//! Dropping the handle kills any child that is still alive, so no game
//! outlives the handle that launched it.

use crate::error::ProcessError;
use log::{debug, info, warn};
use shared::GameDescriptor;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Time a game gets to exit after the polite stop request.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Time allowed for the OS to reap the child after a forced kill.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct GameProcess {
    executable: String,
    arguments: Vec<String>,
    /// `None` inherits the server's working directory
    working_directory: Option<PathBuf>,
    grace_period: Duration,
    child: Option<Child>,
    pid: Option<u32>,
    running: bool,
    exit_status: Option<ExitStatus>,
}

impl GameProcess {
    pub fn new(executable: impl Into<String>, arguments: &str, working_directory: &str) -> Self {
        let working_directory = if working_directory.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(working_directory))
        };

        Self {
            executable: executable.into(),
            arguments: arguments.split_whitespace().map(str::to_string).collect(),
            working_directory,
            grace_period: DEFAULT_GRACE_PERIOD,
            child: None,
            pid: None,
            running: false,
            exit_status: None,
        }
    }

    pub fn from_descriptor(game: &GameDescriptor) -> Self {
        Self::new(
            game.executable_path.clone(),
            &game.arguments,
            &game.working_directory,
        )
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Spawns the child and returns its OS process id.
    pub fn start(&mut self) -> Result<u32, ProcessError> {
        if self.child.is_some() {
            return Err(ProcessError::AlreadyStarted(self.pid.unwrap_or_default()));
        }

        let mut command = Command::new(&self.executable);
        command
            .args(&self.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| ProcessError::Spawn {
            executable: self.executable.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        info!(
            "Started {} (pid {}) with args {:?}",
            self.executable, pid, self.arguments
        );

        self.child = Some(child);
        self.pid = Some(pid);
        self.running = true;
        self.exit_status = None;
        Ok(pid)
    }

    /// Checks the OS rather than the cached flag, so a game that quit on its
    /// own is noticed here.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(Some(status)) => {
                info!(
                    "{} (pid {}) exited on its own: {}",
                    self.executable,
                    self.pid.unwrap_or_default(),
                    status
                );
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(
                    "Could not query pid {}: {}",
                    self.pid.unwrap_or_default(),
                    e
                );
                self.running
            }
        }
    }

    /// Stops the child and waits until the OS confirms it is gone.
    ///
    /// Calling this with no live child is a successful no-op. On failure the
    /// child stays owned by this handle, so dropping it still kills it.
    pub async fn terminate(&mut self) -> Result<(), ProcessError> {
        let Some(mut child) = self.child.take() else {
            self.running = false;
            return Ok(());
        };
        let pid = self.pid.unwrap_or_default();

        if let Ok(Some(status)) = child.try_wait() {
            debug!("pid {} already exited: {}", pid, status);
            self.record_exit(status);
            return Ok(());
        }

        #[cfg(unix)]
        {
            if request_stop(pid) {
                match timeout(self.grace_period, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!("{} (pid {}) stopped: {}", self.executable, pid, status);
                        self.record_exit(status);
                        return Ok(());
                    }
                    Ok(Err(e)) => warn!("Waiting for pid {} failed: {}", pid, e),
                    Err(_) => warn!(
                        "pid {} ignored SIGTERM for {:?}, killing",
                        pid, self.grace_period
                    ),
                }
            }
        }

        if let Err(e) = child.start_kill() {
            warn!("Kill request for pid {} failed: {}", pid, e);
        }

        match timeout(KILL_CONFIRM_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} (pid {}) killed: {}", self.executable, pid, status);
                self.record_exit(status);
                Ok(())
            }
            Ok(Err(e)) => {
                self.child = Some(child);
                Err(ProcessError::Terminate {
                    pid,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.child = Some(child);
                Err(ProcessError::Terminate {
                    pid,
                    reason: format!("still alive {:?} after kill", KILL_CONFIRM_TIMEOUT),
                })
            }
        }
    }

    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Exit status of the last child, once it has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.child = None;
        self.running = false;
        self.exit_status = Some(status);
    }
}

impl Drop for GameProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                warn!(
                    "Killing {} (pid {}) on handle drop",
                    self.executable,
                    self.pid.unwrap_or_default()
                );
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            warn!("SIGTERM to pid {} failed: {}", pid, e);
            false
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    /// Tests descriptor to process conversion
    #[test]
    fn test_arguments_and_working_directory_parsing() {
        let process = GameProcess::new("/opt/game", "  -vr   --fullscreen ", "  ");
        assert_eq!(process.arguments(), &["-vr", "--fullscreen"]);
        assert!(process.working_directory.is_none());
        assert!(process.process_id().is_none());

        let process = GameProcess::new("/opt/game", "", "/opt");
        assert!(process.arguments().is_empty());
        assert_eq!(process.working_directory, Some(PathBuf::from("/opt")));
    }

    /// Tests starting and terminating a child
    #[tokio::test]
    async fn test_start_and_terminate() {
        let mut process = GameProcess::new("sleep", "30", "");
        let pid = assert_ok!(process.start());

        assert!(pid > 0);
        assert_eq!(process.process_id(), Some(pid));
        assert!(process.is_running());

        assert_ok!(process.terminate().await);
        assert!(!process.is_running());
        assert!(process.exit_status().is_some());
    }

    /// Tests terminating twice
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut process = GameProcess::new("sleep", "30", "");
        assert_ok!(process.terminate().await);

        assert_ok!(process.start());
        assert_ok!(process.terminate().await);
        assert_ok!(process.terminate().await);
        assert!(!process.is_running());
    }

    /// Tests spawn failure for a missing executable
    #[tokio::test]
    async fn test_missing_executable_fails_to_start() {
        let mut process = GameProcess::new("/definitely/not/a/game", "", "");
        let err = assert_err!(process.start());

        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(!process.is_running());
        assert!(process.process_id().is_none());
    }

    /// Tests that a second start is refused
    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut process = GameProcess::new("sleep", "30", "");
        assert_ok!(process.start());
        assert!(matches!(
            process.start(),
            Err(ProcessError::AlreadyStarted(_))
        ));
        assert_ok!(process.terminate().await);
    }

    /// Tests detection of a child that exits on its own
    #[tokio::test]
    async fn test_self_exit_is_detected() {
        let mut process = GameProcess::new("true", "", "");
        assert_ok!(process.start());

        let mut attempts = 0;
        while process.is_running() && attempts < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            attempts += 1;
        }

        assert!(!process.is_running());
        assert!(process.exit_status().is_some_and(|s| s.success()));
    }

    /// Tests the forced kill after the grace period
    #[tokio::test]
    async fn test_sigterm_ignoring_child_is_killed() {
        let mut process =
            GameProcess::new("sh", "", "").with_grace_period(Duration::from_millis(200));
        process.arguments = vec!["-c".into(), "trap '' TERM; sleep 30".into()];
        assert_ok!(process.start());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_ok!(process.terminate().await);
        assert!(!process.is_running());
    }

    /// Tests that dropping the handle kills the child
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_drop_kills_child() {
        let pid = {
            let mut process = GameProcess::new("sleep", "30", "");
            assert_ok!(process.start())
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        // gone, or a zombie waiting for the runtime's orphan reaper
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).unwrap_or_default();
        let state = stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next());
        assert!(
            matches!(state, None | Some("Z") | Some("X")),
            "pid {} survived its handle",
            pid
        );
    }
}
