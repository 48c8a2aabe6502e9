//! Orchestrator - the iteration loop: read state, dispatch a phase, run gates

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::gates::{GateResult, GateRunner};
use crate::lock::LockManager;
use crate::shutdown::EXIT_INTERRUPTED;
use crate::state::{OrchestrationState, QueryOptions, StateEngine, StateSnapshot};
use crate::worker::{AgentResult, Phase, PhaseContext, PhaseRunner};

use super::run_log::RunLog;

/// Knobs for one orchestrator run
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub state_path: PathBuf,
    pub gate_commands: Vec<String>,
    pub max_iterations: u32,
    pub max_fix_attempts: u32,
    pub state_ttl: Duration,
    /// Pause between iterations
    pub pause: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            state_path: config.project.state_path(),
            gate_commands: config.gates.commands.clone(),
            max_iterations: config.run_loop.max_iterations,
            max_fix_attempts: config.run_loop.max_fix_attempts,
            state_ttl: Duration::from_millis(config.run_loop.state_ttl_ms),
            pause: Duration::from_millis(config.run_loop.pause_ms),
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum StopReason {
    /// Every task is complete
    Done,
    /// The state file does not exist
    NoState,
    /// Iteration cap reached with work remaining
    MaxIterations,
    /// A worker failed fatally or exhausted its retries
    WorkerFailed { phase: Phase, exit_code: i32, error: String },
    /// The state file exists but could not be read
    StateUnreadable { error: String },
    /// Shutdown began before the next iteration
    Interrupted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Done => write!(f, "all tasks complete"),
            Self::NoState => write!(f, "state file not found"),
            Self::MaxIterations => write!(f, "iteration limit reached"),
            Self::WorkerFailed { phase, exit_code, error } => {
                write!(f, "{} worker failed (exit code {}): {}", phase, exit_code, error)
            }
            Self::StateUnreadable { error } => write!(f, "state file unreadable: {}", error),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopOutcome {
    pub reason: StopReason,
    /// Iterations started
    pub iterations: u32,
    /// Worker dispatches across all phases
    pub dispatches: u32,
    pub gate_runs: u32,
    /// The final iteration ended with gates still failing after every fix attempt
    pub gates_exhausted: bool,
}

impl LoopOutcome {
    pub fn exit_code(&self) -> i32 {
        match &self.reason {
            StopReason::Done => 0,
            StopReason::MaxIterations if !self.gates_exhausted => 0,
            StopReason::Interrupted => EXIT_INTERRUPTED,
            _ => 1,
        }
    }
}

/// Result of a single iteration
#[derive(Debug)]
enum IterationResult {
    /// Go on to the next iteration
    Continue,
    /// Gates kept failing after every fix attempt; go on anyway
    GatesExhausted,
    Stop(StopReason),
}

/// Lock the run holds, refreshed with progress each iteration
#[derive(Debug, Clone)]
pub struct LockBinding {
    pub manager: LockManager,
    pub pid: u32,
}

pub struct Orchestrator<R: PhaseRunner> {
    runner: R,
    gates: GateRunner,
    state: StateEngine,
    settings: LoopSettings,
    log: RunLog,
    lock: Option<LockBinding>,
    stop: Option<Arc<AtomicBool>>,
    dispatches: u32,
    gate_runs: u32,
}

impl<R: PhaseRunner> Orchestrator<R> {
    pub fn new(runner: R, gates: GateRunner, settings: LoopSettings, log: RunLog) -> Self {
        debug!(?settings, "Orchestrator::new: called");
        Self {
            runner,
            gates,
            state: StateEngine::new(),
            settings,
            log,
            lock: None,
            stop: None,
            dispatches: 0,
            gate_runs: 0,
        }
    }

    /// Record iteration and state in the lock as the loop progresses
    pub fn with_lock(mut self, lock: LockBinding) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Stop before starting another iteration once `flag` is set
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop = Some(flag);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run until done, a terminal condition, or the iteration cap
    pub async fn run(&mut self) -> LoopOutcome {
        let max = self.settings.max_iterations;
        info!(state_file = %self.settings.state_path.display(), max_iterations = max, "Starting loop");
        self.log.info(
            "loop.start",
            format!("state_file={} max_iterations={}", self.settings.state_path.display(), max),
        );

        let mut iteration = 0;
        let mut gates_exhausted = false;
        let reason = loop {
            if iteration >= max {
                warn!(max_iterations = max, "Iteration limit reached with work remaining");
                self.log.warn("loop.max-iterations", format!("max_iterations={}", max));
                break StopReason::MaxIterations;
            }
            if self.stopping() {
                info!("Shutdown in progress, not starting another iteration");
                break StopReason::Interrupted;
            }

            iteration += 1;
            info!("Iteration {}/{}", iteration, max);
            self.log.info("iteration.start", format!("iteration={}", iteration));

            let result = self.run_iteration(iteration).await;
            self.log.info("iteration.end", format!("iteration={} result={:?}", iteration, result));

            match result {
                IterationResult::Continue => gates_exhausted = false,
                IterationResult::GatesExhausted => gates_exhausted = true,
                IterationResult::Stop(reason) => break reason,
            }

            if iteration < max && !self.settings.pause.is_zero() {
                tokio::time::sleep(self.settings.pause).await;
            }
        };

        let outcome = LoopOutcome {
            reason,
            iterations: iteration,
            dispatches: self.dispatches,
            gate_runs: self.gate_runs,
            gates_exhausted,
        };
        let detail = format!(
            "reason={} iterations={} exit_code={}",
            outcome.reason,
            outcome.iterations,
            outcome.exit_code()
        );
        if outcome.exit_code() == 0 {
            info!(reason = %outcome.reason, iterations = outcome.iterations, "Loop finished");
            self.log.info("loop.end", detail);
        } else {
            error!(reason = %outcome.reason, iterations = outcome.iterations, "Loop stopped");
            self.log.error("loop.end", detail);
        }
        outcome
    }

    fn stopping(&self) -> bool {
        self.stop.as_ref().is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    async fn run_iteration(&mut self, iteration: u32) -> IterationResult {
        debug!(iteration, "Orchestrator::run_iteration: called");
        let opts = QueryOptions {
            force_refresh: true,
            ttl: self.settings.state_ttl,
        };
        let snapshot = match self.state.query(&self.settings.state_path, opts) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Failed to read state");
                self.log.error("state.error", e.to_string());
                return IterationResult::Stop(StopReason::StateUnreadable { error: e.to_string() });
            }
        };
        self.record_state(iteration, &snapshot);

        let task_id = snapshot.active_item.as_ref().map(|row| row.id.clone());
        match snapshot.state {
            OrchestrationState::Done => IterationResult::Stop(StopReason::Done),
            OrchestrationState::NoState => {
                error!(path = %self.settings.state_path.display(), "State file not found");
                IterationResult::Stop(StopReason::NoState)
            }
            OrchestrationState::WorkLeft => self.implement(iteration, task_id).await,
            OrchestrationState::InReview => self.single_phase(Phase::Review, iteration, task_id).await,
            OrchestrationState::Blocked => self.single_phase(Phase::Tidy, iteration, task_id).await,
        }
    }

    fn record_state(&self, iteration: u32, snapshot: &StateSnapshot) {
        let stats = snapshot.stats;
        let active = snapshot
            .active_item
            .as_ref()
            .map(|row| format!("{} ({})", row.id, row.title))
            .unwrap_or_else(|| "-".to_string());
        info!(
            state = %snapshot.state,
            total = stats.total,
            completed = stats.completed,
            remaining = stats.remaining,
            "State observed, active item: {}",
            active
        );
        self.log.info(
            "state",
            format!(
                "iteration={} state={} total={} completed={} remaining={} in_review={} blocked={} active={}",
                iteration,
                snapshot.state,
                stats.total,
                stats.completed,
                stats.remaining,
                stats.in_review,
                stats.blocked,
                active
            ),
        );

        if let Some(lock) = &self.lock
            && let Err(e) = lock.manager.update(lock.pid, iteration, snapshot.state.as_str())
        {
            warn!(error = %e, "Failed to update lock record");
        }
    }

    /// Review and tidy: one dispatch, no gates
    async fn single_phase(&mut self, phase: Phase, iteration: u32, task_id: Option<String>) -> IterationResult {
        let context = PhaseContext {
            iteration,
            task_id,
            ..Default::default()
        };
        match self.dispatch(phase, &context).await {
            Some(reason) => IterationResult::Stop(reason),
            None => IterationResult::Continue,
        }
    }

    /// Implement, then gates, then up to `max_fix_attempts` rounds of fix + gates
    async fn implement(&mut self, iteration: u32, task_id: Option<String>) -> IterationResult {
        let context = PhaseContext {
            iteration,
            task_id: task_id.clone(),
            ..Default::default()
        };
        if let Some(reason) = self.dispatch(Phase::Implement, &context).await {
            return IterationResult::Stop(reason);
        }

        let mut gates = self.run_gates(iteration).await;
        let mut fix_attempts = 0;
        while !gates.is_success && fix_attempts < self.settings.max_fix_attempts {
            if gates.interrupted || self.stopping() {
                return IterationResult::Stop(StopReason::Interrupted);
            }
            fix_attempts += 1;
            info!(
                "Gates failed, fix attempt {}/{}",
                fix_attempts, self.settings.max_fix_attempts
            );
            let context = PhaseContext {
                iteration,
                fix_attempt: Some(fix_attempts),
                task_id: task_id.clone(),
                gate_failure: gates.error.clone(),
            };
            if let Some(reason) = self.dispatch(Phase::Fix, &context).await {
                return IterationResult::Stop(reason);
            }
            gates = self.run_gates(iteration).await;
        }

        if gates.interrupted {
            return IterationResult::Stop(StopReason::Interrupted);
        }
        if gates.is_success {
            IterationResult::Continue
        } else {
            warn!(
                fix_attempts,
                "Gates still failing after {} fix attempts, moving on", fix_attempts
            );
            self.log.warn(
                "gates.exhausted",
                format!(
                    "iteration={} fix_attempts={} error={}",
                    iteration,
                    fix_attempts,
                    gates.error.as_deref().unwrap_or("-")
                ),
            );
            IterationResult::GatesExhausted
        }
    }

    /// Run one phase worker; `Some` means the loop must stop
    async fn dispatch(&mut self, phase: Phase, context: &PhaseContext) -> Option<StopReason> {
        if self.stopping() {
            info!(%phase, "Shutdown in progress, not dispatching");
            return Some(StopReason::Interrupted);
        }
        self.dispatches += 1;
        let attempt = context.fix_attempt.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string());
        info!(%phase, iteration = context.iteration, "Dispatching {} worker", phase);
        self.log.info(
            "worker.dispatch",
            format!(
                "phase={} iteration={} fix_attempt={} task={}",
                phase,
                context.iteration,
                attempt,
                context.task_id.as_deref().unwrap_or("-")
            ),
        );

        let result: AgentResult = self.runner.run_phase(phase, context).await;
        let detail = format!(
            "phase={} success={} exit_code={} attempts={}",
            phase,
            result.is_success,
            result.exit_code,
            result.attempts.len()
        );
        if result.is_success {
            self.log.info("worker.result", detail);
            return None;
        }

        let error = result.error.unwrap_or_else(|| format!("exit code {}", result.exit_code));
        if self.stopping() {
            warn!(%phase, exit_code = result.exit_code, "Worker stopped by shutdown");
            self.log.warn("worker.result", format!("{} interrupted=true", detail));
            return Some(StopReason::Interrupted);
        }
        error!(%phase, exit_code = result.exit_code, "Worker failed: {}", error);
        self.log.error("worker.result", format!("{} error={}", detail, error));
        Some(StopReason::WorkerFailed {
            phase,
            exit_code: result.exit_code,
            error,
        })
    }

    async fn run_gates(&mut self, iteration: u32) -> GateResult {
        self.gate_runs += 1;
        let result = self.gates.run(&self.settings.gate_commands).await;
        for command in &result.results {
            self.log.event(
                if command.is_success {
                    tracing::Level::INFO
                } else {
                    tracing::Level::WARN
                },
                "gate.command",
                format!(
                    "command={:?} success={} exit_code={} duration_ms={}",
                    command.command, command.is_success, command.exit_code, command.duration_ms
                ),
            );
        }
        self.log.info(
            "gates.result",
            format!(
                "iteration={} success={} interrupted={} passed={}/{} duration_ms={}",
                iteration,
                result.is_success,
                result.interrupted,
                result.passed_count(),
                result.results.len(),
                result.total_duration_ms
            ),
        );
        result
    }
}
