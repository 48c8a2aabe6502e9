//! Gate execution: validation commands run in order after the implement phase

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::process::{CommandSpec, NOT_FOUND_EXIT_CODE, ProcessSupervisor, SupervisorError, tail_lines};
use crate::shutdown::EXIT_INTERRUPTED;

/// Lines of output kept in a failure summary
const FAILURE_TAIL_LINES: usize = 20;

/// Result of running one gate command
#[derive(Debug, Clone, Serialize)]
pub struct GateCommandResult {
    pub command: String,
    pub is_success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl GateCommandResult {
    /// Short description of this command's failure with a tail of its output
    pub fn failure_summary(&self) -> String {
        let mut summary = format!("Gate '{}' failed with exit code {}", self.command, self.exit_code);
        let output = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let tail = tail_lines(output, FAILURE_TAIL_LINES);
        if !tail.is_empty() {
            summary.push_str(":\n");
            summary.push_str(&tail);
        }
        summary
    }
}

/// Aggregate of one gate run
#[derive(Debug, Clone, Serialize)]
pub struct GateResult {
    /// AND of every command's success
    pub is_success: bool,
    /// One entry per command, in declared order
    pub results: Vec<GateCommandResult>,
    pub total_duration_ms: u64,
    /// Summary of the first failing command
    pub error: Option<String>,
    /// Shutdown cut the run short; commands after the last result never started
    pub interrupted: bool,
}

impl GateResult {
    pub fn first_failure(&self) -> Option<&GateCommandResult> {
        self.results.iter().find(|r| !r.is_success)
    }

    pub fn passed_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success).count()
    }
}

#[derive(Debug, Clone)]
pub struct GateRunner {
    supervisor: ProcessSupervisor,
    cwd: PathBuf,
    timeout: Duration,
    stop: Option<Arc<AtomicBool>>,
}

impl GateRunner {
    pub fn new(supervisor: ProcessSupervisor, cwd: PathBuf, timeout: Duration) -> Self {
        Self {
            supervisor,
            cwd,
            timeout,
            stop: None,
        }
    }

    /// Start no further commands once `flag` is set
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    fn stopping(&self) -> bool {
        self.stop.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Run every command sequentially; a failure does not stop later commands,
    /// shutdown does
    pub async fn run(&self, commands: &[String]) -> GateResult {
        debug!(count = commands.len(), timeout = ?self.timeout, "GateRunner::run: called");
        let start = Instant::now();

        if commands.is_empty() {
            debug!("GateRunner::run: no gates configured");
            return GateResult {
                is_success: true,
                results: Vec::new(),
                total_duration_ms: 0,
                error: None,
                interrupted: false,
            };
        }

        let mut results = Vec::with_capacity(commands.len());
        let mut interrupted = false;
        for command in commands {
            if self.stopping() {
                info!(remaining = commands.len() - results.len(), "Shutdown in progress, skipping remaining gates");
                interrupted = true;
                break;
            }
            let (result, refused) = self.run_one(command).await;
            if result.is_success {
                info!(command = %command, duration_ms = result.duration_ms, "Gate passed");
            } else {
                warn!(command = %command, exit_code = result.exit_code, duration_ms = result.duration_ms, "Gate failed");
            }
            results.push(result);
            if refused {
                interrupted = true;
                break;
            }
        }

        let is_success = !interrupted && results.iter().all(|r| r.is_success);
        let error = results
            .iter()
            .find(|r| !r.is_success)
            .map(GateCommandResult::failure_summary)
            .or_else(|| interrupted.then(|| "Gates interrupted by shutdown".to_string()));
        let total_duration_ms = start.elapsed().as_millis() as u64;
        debug!(is_success, interrupted, total_duration_ms, "GateRunner::run: finished");

        GateResult {
            is_success,
            results,
            total_duration_ms,
            error,
            interrupted,
        }
    }

    /// Second value is true when the supervisor refused to start the command
    async fn run_one(&self, command: &str) -> (GateCommandResult, bool) {
        debug!(%command, "GateRunner::run_one: called");
        let spec = CommandSpec::shell(command)
            .with_cwd(self.cwd.clone())
            .with_timeout(self.timeout);
        let start = Instant::now();

        match self.supervisor.run(&spec).await {
            Ok(outcome) => (
                GateCommandResult {
                    command: command.to_string(),
                    is_success: outcome.success,
                    exit_code: outcome.exit_code,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    duration_ms: outcome.duration.as_millis() as u64,
                },
                false,
            ),
            Err(e) => {
                warn!(%command, error = %e, "Gate could not be started");
                let exit_code = match e {
                    SupervisorError::NotFound { .. } => NOT_FOUND_EXIT_CODE,
                    SupervisorError::ShuttingDown { .. } => EXIT_INTERRUPTED,
                    _ => 1,
                };
                let refused = matches!(e, SupervisorError::ShuttingDown { .. });
                (
                    GateCommandResult {
                        command: command.to_string(),
                        is_success: false,
                        exit_code,
                        stdout: String::new(),
                        stderr: e.to_string(),
                        duration_ms: start.elapsed().as_millis() as u64,
                    },
                    refused,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::TIMEOUT_EXIT_CODE;
    use crate::shutdown::ChildTracker;
    use tempfile::tempdir;

    fn runner(cwd: PathBuf, timeout: Duration) -> GateRunner {
        let supervisor = ProcessSupervisor::new(ChildTracker::new(), Duration::from_millis(500));
        GateRunner::new(supervisor, cwd, timeout)
    }

    fn cmds(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_gate_list_succeeds() {
        let temp = tempdir().unwrap();

        let result = runner(temp.path().to_path_buf(), Duration::from_secs(5)).run(&[]).await;

        assert!(result.is_success);
        assert!(result.results.is_empty());
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_all_commands_run_after_failure() {
        let temp = tempdir().unwrap();
        let commands = cmds(&[
            "echo first >> order.txt",
            "echo second >> order.txt; echo 'lint: bad indent' >&2; exit 2",
            "echo third >> order.txt; echo 'tests broke' >&2; exit 1",
        ]);

        let result = runner(temp.path().to_path_buf(), Duration::from_secs(5)).run(&commands).await;

        assert!(!result.is_success);
        assert_eq!(result.results.len(), 3);
        assert_eq!(result.passed_count(), 1);
        let error = result.error.unwrap();
        assert!(error.contains("exit code 2"));
        assert!(error.contains("bad indent"));
        assert!(!error.contains("tests broke"));
        let order = std::fs::read_to_string(temp.path().join("order.txt")).unwrap();
        assert_eq!(order, "first\nsecond\nthird\n");
    }

    #[tokio::test]
    async fn test_timeout_marks_command_failed() {
        let temp = tempdir().unwrap();

        let result = runner(temp.path().to_path_buf(), Duration::from_millis(100))
            .run(&cmds(&["sleep 10", "true"]))
            .await;

        assert!(!result.is_success);
        assert_eq!(result.results[0].exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.results[0].stderr.contains("timed out"));
        assert!(result.results[1].is_success);
        assert_eq!(result.first_failure().unwrap().command, "sleep 10");
    }

    #[tokio::test]
    async fn test_missing_cwd_fails_gate_instead_of_erroring() {
        let temp = tempdir().unwrap();

        let result = runner(temp.path().join("gone"), Duration::from_secs(5))
            .run(&cmds(&["true"]))
            .await;

        assert!(!result.is_success);
        assert_eq!(result.results[0].exit_code, 1);
        assert!(result.error.unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_stop_flag_prevents_later_gates() {
        let temp = tempdir().unwrap();
        let flag = Arc::new(AtomicBool::new(false));
        let gates = runner(temp.path().to_path_buf(), Duration::from_secs(5)).with_stop_flag(flag.clone());
        let commands = cmds(&["touch g1; sleep 0.3", "touch g2"]);

        let running = gates.run(&commands);
        let interrupt = async {
            for _ in 0..100 {
                if temp.path().join("g1").exists() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            flag.store(true, Ordering::SeqCst);
        };
        let (result, ()) = tokio::join!(running, interrupt);

        assert!(result.interrupted);
        assert!(!result.is_success);
        assert_eq!(result.results.len(), 1);
        assert!(result.results[0].is_success);
        assert_eq!(result.error.as_deref(), Some("Gates interrupted by shutdown"));
        assert!(temp.path().join("g1").exists());
        assert!(!temp.path().join("g2").exists());
    }

    #[tokio::test]
    async fn test_closed_tracker_interrupts_gates() {
        let temp = tempdir().unwrap();
        let gates = runner(temp.path().to_path_buf(), Duration::from_secs(5));
        gates.supervisor.children().close();

        let result = gates.run(&cmds(&["touch g1", "touch g2"])).await;

        assert!(result.interrupted);
        assert!(!result.is_success);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].exit_code, EXIT_INTERRUPTED);
        assert!(!temp.path().join("g1").exists());
        assert!(!temp.path().join("g2").exists());
    }

    #[test]
    fn test_failure_summary_prefers_stderr() {
        let result = GateCommandResult {
            command: "make check".to_string(),
            is_success: false,
            exit_code: 1,
            stdout: "building\n".to_string(),
            stderr: "error: boom\n".to_string(),
            duration_ms: 5,
        };

        let summary = result.failure_summary();

        assert!(summary.starts_with("Gate 'make check' failed with exit code 1"));
        assert!(summary.ends_with("error: boom"));
    }
}
