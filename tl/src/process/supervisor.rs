//! ProcessSupervisor - spawn one external command and wait for it
//!
//! Every child is registered with the [`ChildTracker`] for as long as it is
//! being awaited, so a signal-driven shutdown can terminate it.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::shutdown::{ChildTracker, TrackedChild};

/// Exit code reported when a command is killed for exceeding its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the real code is unavailable (e.g. killed by a signal)
pub const UNKNOWN_EXIT_CODE: i32 = 1;

/// Conventional shell code for "command not found"
pub const NOT_FOUND_EXIT_CODE: i32 = 127;

/// How the child's stdio is wired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdioMode {
    /// Child shares the orchestrator's terminal
    #[default]
    Inherit,
    /// stdout/stderr are captured; stdin is closed
    Piped,
}

/// Description of one command to run
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdio: StdioMode,
    pub timeout: Option<Duration>,
    /// Start the child in its own process group so the group can be signalled
    pub process_group: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: Vec::new(),
            stdio: StdioMode::Inherit,
            timeout: None,
            process_group: false,
        }
    }

    /// A `sh -c` command with captured output, in its own process group
    pub fn shell(command: &str) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd: None,
            env: Vec::new(),
            stdio: StdioMode::Piped,
            timeout: None,
            process_group: true,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a command that was spawned and awaited
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub success: bool,
    /// Captured stdout (empty when stdio is inherited)
    pub stdout: String,
    /// Captured stderr (empty when stdio is inherited)
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
    /// Signal that terminated the child, if any
    pub signal: Option<i32>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Executable '{program}' not found; install it or point the config at its full path")]
    NotFound { program: String },

    #[error("Working directory {cwd} does not exist")]
    MissingCwd { cwd: PathBuf },

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Refused to start '{program}': shutdown in progress")]
    ShuttingDown { program: String },

    #[error("Failed waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Untracks the child when the wait is over, on every exit path
struct TrackGuard {
    tracker: ChildTracker,
    pid: u32,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.tracker.untrack(self.pid);
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    children: ChildTracker,
    kill_grace: Duration,
}

impl ProcessSupervisor {
    pub fn new(children: ChildTracker, kill_grace: Duration) -> Self {
        Self { children, kill_grace }
    }

    pub fn children(&self) -> &ChildTracker {
        &self.children
    }

    /// Spawn `spec` and wait for it, enforcing its timeout
    pub async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutcome, SupervisorError> {
        debug!(program = %spec.program, args = ?spec.args, stdio = ?spec.stdio, timeout = ?spec.timeout, "ProcessSupervisor::run: called");

        if let Some(cwd) = &spec.cwd
            && !cwd.is_dir()
        {
            return Err(SupervisorError::MissingCwd { cwd: cwd.clone() });
        }
        if self.children.is_closed() {
            debug!(program = %spec.program, "ProcessSupervisor::run: tracker closed, not spawning");
            return Err(SupervisorError::ShuttingDown {
                program: spec.program.clone(),
            });
        }

        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args).kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        match spec.stdio {
            StdioMode::Inherit => {
                cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
            StdioMode::Piped => {
                cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }
        #[cfg(unix)]
        if spec.process_group {
            cmd.process_group(0);
        }

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                debug!(program = %spec.program, "ProcessSupervisor::run: executable not found");
                SupervisorError::NotFound {
                    program: spec.program.clone(),
                }
            } else {
                SupervisorError::Spawn {
                    program: spec.program.clone(),
                    source,
                }
            }
        })?;

        let tracked = child.id().map(|pid| TrackedChild {
            pid,
            process_group: spec.process_group,
        });
        let mut _guard = None;
        if let Some(t) = tracked {
            if !self.children.track(t) {
                // Shutdown began between the check above and the spawn
                warn!(pid = t.pid, program = %spec.program, "Killing child spawned during shutdown");
                t.signal(Signal::SIGKILL);
                let _ = child.wait().await;
                return Err(SupervisorError::ShuttingDown {
                    program: spec.program.clone(),
                });
            }
            _guard = Some(TrackGuard {
                tracker: self.children.clone(),
                pid: t.pid,
            });
        }
        debug!(pid = ?tracked.map(|t| t.pid), "ProcessSupervisor::run: spawned");

        let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_to_string(out)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_to_string(err)));

        let waited = match spec.timeout {
            Some(limit) => tokio::select! {
                status = child.wait() => Some(status),
                _ = tokio::time::sleep(limit) => None,
            },
            None => Some(child.wait().await),
        };

        let (status, timed_out) = match waited {
            Some(status) => (status, false),
            None => {
                warn!(program = %spec.program, timeout = ?spec.timeout, "Command timed out, terminating");
                (self.terminate(&mut child, tracked).await, true)
            }
        };
        let status = status.map_err(|source| SupervisorError::Wait {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = self.collect(stdout_task).await;
        let mut stderr = self.collect(stderr_task).await;
        let duration = start.elapsed();

        let exit_code = if timed_out {
            let limit = spec.timeout.unwrap_or_default();
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("Command timed out after {:?}", limit));
            TIMEOUT_EXIT_CODE
        } else {
            status.code().unwrap_or(UNKNOWN_EXIT_CODE)
        };

        let outcome = ProcessOutcome {
            exit_code,
            success: !timed_out && status.success(),
            stdout,
            stderr,
            duration,
            timed_out,
            signal: exit_signal(&status),
        };
        debug!(
            exit_code = outcome.exit_code,
            success = outcome.success,
            duration_ms = duration.as_millis() as u64,
            "ProcessSupervisor::run: finished"
        );
        Ok(outcome)
    }

    /// SIGTERM, wait out the grace window, then SIGKILL
    async fn terminate(&self, child: &mut Child, tracked: Option<TrackedChild>) -> io::Result<ExitStatus> {
        debug!(?tracked, "ProcessSupervisor::terminate: called");
        if let Some(t) = tracked {
            t.signal(Signal::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(self.kill_grace, child.wait()).await {
            if let Some(t) = tracked.filter(|t| t.process_group) {
                t.signal(Signal::SIGKILL);
            }
            return status;
        }
        warn!(?tracked, "Child ignored SIGTERM, killing");
        match tracked {
            Some(t) => {
                t.signal(Signal::SIGKILL);
            }
            None => {
                let _ = child.start_kill();
            }
        }
        child.wait().await
    }

    /// Join an output reader, giving up if a straggling grandchild holds the pipe open
    async fn collect(&self, task: Option<JoinHandle<String>>) -> String {
        let Some(mut task) = task else {
            return String::new();
        };
        match tokio::time::timeout(self.kill_grace, &mut task).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(error = %e, "Output reader task failed");
                String::new()
            }
            Err(_) => {
                warn!("Output pipe still open after child exit, abandoning read");
                task.abort();
                String::new()
            }
        }
    }
}

async fn read_to_string<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!(error = %e, "read_to_string: read failed");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Last `max_lines` lines of `text`, for error summaries
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(ChildTracker::new(), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let temp = tempdir().unwrap();
        let spec = CommandSpec::shell("echo hello; echo oops >&2; exit 3").with_cwd(temp.path());

        let outcome = supervisor().run(&spec).await.unwrap();

        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success);
        assert!(outcome.stdout.contains("hello"));
        assert!(outcome.stderr.contains("oops"));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "x").unwrap();
        let spec = CommandSpec::shell("ls").with_cwd(temp.path());

        let outcome = supervisor().run(&spec).await.unwrap();

        assert!(outcome.success);
        assert!(outcome.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let spec = CommandSpec::shell("echo $TASKLOOP_PHASE").with_env("TASKLOOP_PHASE", "fix");

        let outcome = supervisor().run(&spec).await.unwrap();

        assert_eq!(outcome.stdout.trim(), "fix");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_124() {
        let sup = supervisor();
        let spec = CommandSpec::shell("sleep 10").with_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let outcome = sup.run(&spec).await.unwrap();

        assert!(outcome.timed_out);
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        assert!(outcome.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(sup.children().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-3f9a", vec![]);

        let err = supervisor().run(&spec).await.unwrap_err();

        assert!(matches!(err, SupervisorError::NotFound { .. }));
        assert!(err.to_string().contains("definitely-not-a-real-binary-3f9a"));
    }

    #[tokio::test]
    async fn test_missing_cwd_is_reported() {
        let temp = tempdir().unwrap();
        let spec = CommandSpec::shell("true").with_cwd(temp.path().join("gone"));

        let err = supervisor().run(&spec).await.unwrap_err();

        assert!(matches!(err, SupervisorError::MissingCwd { .. }));
    }

    #[tokio::test]
    async fn test_killed_by_signal_maps_to_unknown_exit_code() {
        let spec = CommandSpec::shell("kill -9 $$");

        let outcome = supervisor().run(&spec).await.unwrap();

        assert_eq!(outcome.exit_code, UNKNOWN_EXIT_CODE);
        assert_eq!(outcome.signal, Some(9));
    }

    #[tokio::test]
    async fn test_closed_tracker_refuses_to_spawn() {
        let temp = tempdir().unwrap();
        let sup = supervisor();
        sup.children().close();
        let spec = CommandSpec::shell("touch started").with_cwd(temp.path());

        let err = sup.run(&spec).await.unwrap_err();

        assert!(matches!(err, SupervisorError::ShuttingDown { .. }));
        assert!(!temp.path().join("started").exists());
        assert!(sup.children().is_empty());
    }

    #[tokio::test]
    async fn test_close_while_running_lets_current_child_finish() {
        let sup = supervisor();
        let spec = CommandSpec::shell("sleep 0.3; echo done");

        let running = sup.run(&spec);
        let closer = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            sup.children().close();
        };
        let (outcome, ()) = tokio::join!(running, closer);

        let outcome = outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.stdout.trim(), "done");
        assert!(matches!(
            sup.run(&spec).await,
            Err(SupervisorError::ShuttingDown { .. })
        ));
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("only", 5), "only");
        assert_eq!(tail_lines("", 3), "");
    }
}
