//! WorkerDispatcher - run the worker for a phase, retrying transient failures

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::process::{CommandSpec, NOT_FOUND_EXIT_CODE, ProcessSupervisor, StdioMode, SupervisorError, tail_lines};
use crate::shutdown::EXIT_INTERRUPTED;

use super::{Phase, RetryAttempt, RetryPolicy, build_agent_args};

/// Extra information handed to the worker through its environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseContext {
    pub iteration: u32,
    /// Fix attempt number within the iteration (fix phase only)
    pub fix_attempt: Option<u32>,
    pub task_id: Option<String>,
    /// Summary of the failing gate the fix phase should address
    pub gate_failure: Option<String>,
}

/// Result of one dispatch, after any retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResult {
    pub is_success: bool,
    pub exit_code: i32,
    pub error: Option<String>,
    pub attempts: Vec<RetryAttempt>,
}

impl AgentResult {
    pub fn success(attempts: Vec<RetryAttempt>) -> Self {
        Self {
            is_success: true,
            exit_code: 0,
            error: None,
            attempts,
        }
    }

    pub fn failure(exit_code: i32, error: impl Into<String>, attempts: Vec<RetryAttempt>) -> Self {
        Self {
            is_success: false,
            exit_code,
            error: Some(error.into()),
            attempts,
        }
    }
}

/// Seam between the orchestrator and whatever runs a phase
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    async fn run_phase(&self, phase: Phase, context: &PhaseContext) -> AgentResult;
}

#[derive(Debug, Clone)]
pub struct WorkerDispatcher {
    worker: WorkerConfig,
    policy: RetryPolicy,
    supervisor: ProcessSupervisor,
    cwd: PathBuf,
    state_file: PathBuf,
}

impl WorkerDispatcher {
    pub fn new(
        worker: WorkerConfig,
        policy: RetryPolicy,
        supervisor: ProcessSupervisor,
        cwd: PathBuf,
        state_file: PathBuf,
    ) -> Self {
        debug!(command = %worker.command, ?cwd, "WorkerDispatcher::new: called");
        Self {
            worker,
            policy,
            supervisor,
            cwd,
            state_file,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// The exact command that would be spawned for `phase`
    pub fn command_for(&self, phase: Phase, context: &PhaseContext) -> CommandSpec {
        let mut spec = CommandSpec::new(self.worker.command.clone(), build_agent_args(&self.worker, phase))
            .with_cwd(self.cwd.clone())
            .with_stdio(self.worker.stdio)
            .with_env("TASKLOOP_PHASE", phase.as_str())
            .with_env("TASKLOOP_ITERATION", context.iteration.to_string())
            .with_env("TASKLOOP_STATE_FILE", self.state_file.to_string_lossy());
        if let Some(attempt) = context.fix_attempt {
            spec = spec.with_env("TASKLOOP_FIX_ATTEMPT", attempt.to_string());
        }
        if let Some(task_id) = &context.task_id {
            spec = spec.with_env("TASKLOOP_TASK_ID", task_id.clone());
        }
        if let Some(failure) = &context.gate_failure {
            spec = spec.with_env("TASKLOOP_GATE_FAILURE", failure.clone());
        }
        spec
    }

    /// Run the worker for `phase`, retrying retryable exits with backoff
    pub async fn run_agent(&self, phase: Phase, context: &PhaseContext) -> AgentResult {
        debug!(%phase, ?context, max_retries = self.policy.max_retries, "WorkerDispatcher::run_agent: called");
        let spec = self.command_for(phase, context);
        let mut attempts = Vec::new();
        let mut last_exit_code = 1;
        let mut last_error: Option<String> = None;

        for retry in 0..=self.policy.max_retries {
            let delay = self.policy.delay_for(retry);
            if retry > 0 {
                info!(%phase, retry, max_retries = self.policy.max_retries, ?delay, "Retrying worker after backoff");
                tokio::time::sleep(delay).await;
            }
            let attempt = retry + 1;

            match self.supervisor.run(&spec).await {
                Ok(outcome) if outcome.success => {
                    debug!(%phase, attempt, "WorkerDispatcher::run_agent: worker succeeded");
                    attempts.push(RetryAttempt {
                        attempt,
                        delay,
                        exit_code: Some(0),
                        error: None,
                    });
                    return AgentResult::success(attempts);
                }
                Ok(outcome) => {
                    last_exit_code = outcome.exit_code;
                    attempts.push(RetryAttempt {
                        attempt,
                        delay,
                        exit_code: Some(outcome.exit_code),
                        error: None,
                    });
                    if !self.policy.is_retryable(outcome.exit_code) {
                        warn!(%phase, exit_code = outcome.exit_code, "Worker failed with non-retryable exit code");
                        let mut message = format!("{} worker exited with code {}", phase, outcome.exit_code);
                        if self.worker.stdio == StdioMode::Piped && !outcome.stderr.trim().is_empty() {
                            message.push_str(":\n");
                            message.push_str(&tail_lines(&outcome.stderr, 20));
                        }
                        return AgentResult::failure(outcome.exit_code, message, attempts);
                    }
                    warn!(%phase, exit_code = outcome.exit_code, attempt, "Worker failed with retryable exit code");
                }
                Err(SupervisorError::NotFound { program }) => {
                    warn!(%program, "Worker executable not found");
                    attempts.push(RetryAttempt {
                        attempt,
                        delay,
                        exit_code: None,
                        error: Some(format!("{} not found", program)),
                    });
                    return AgentResult::failure(
                        NOT_FOUND_EXIT_CODE,
                        format!(
                            "Worker executable '{}' not found on PATH. Install it or set worker.command in the config to its full path.",
                            program
                        ),
                        attempts,
                    );
                }
                Err(e @ SupervisorError::ShuttingDown { .. }) => {
                    info!(%phase, "Shutdown in progress, worker not started");
                    attempts.push(RetryAttempt {
                        attempt,
                        delay,
                        exit_code: None,
                        error: Some(e.to_string()),
                    });
                    return AgentResult::failure(EXIT_INTERRUPTED, e.to_string(), attempts);
                }
                Err(e) => {
                    warn!(%phase, error = %e, attempt, "Worker failed to start");
                    let message = e.to_string();
                    last_exit_code = 1;
                    attempts.push(RetryAttempt {
                        attempt,
                        delay,
                        exit_code: None,
                        error: Some(message.clone()),
                    });
                    last_error = Some(message);
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            format!(
                "{} worker failed after {} retries (last exit code {})",
                phase, self.policy.max_retries, last_exit_code
            )
        });
        warn!(%phase, exit_code = last_exit_code, "Worker retries exhausted");
        AgentResult::failure(last_exit_code, error, attempts)
    }
}

#[async_trait]
impl PhaseRunner for WorkerDispatcher {
    async fn run_phase(&self, phase: Phase, context: &PhaseContext) -> AgentResult {
        self.run_agent(phase, context).await
    }
}
