//! `tl run`: the orchestration loop wrapped in lock and shutdown handling
//!
//! Order of events: signal handlers, lock, cleanup registration (lock release
//! first, run-log flush second so the flush runs first), loop, drain. Once a
//! signal has arrived the drain and the exit code belong to the shutdown path.

use std::time::Duration;

use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::gates::GateRunner;
use crate::lock::{LockError, LockManager, ProcessInfo};
use crate::orchestrator::{LockBinding, LoopOutcome, LoopSettings, Orchestrator, RunLog, StopReason};
use crate::process::ProcessSupervisor;
use crate::shutdown::{ChildTracker, CleanupRegistry, ShutdownSignal, SignalCoordinator};
use crate::worker::{RetryPolicy, WorkerDispatcher};

/// Exit code when the lock is held by another run
pub const EXIT_ALREADY_RUNNING: i32 = 1;

/// Extra time granted to the signal handler beyond its own timeouts
const HANDLER_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Overrides `loop.max-iterations`
    pub max_iterations: Option<u32>,
    /// Replace an existing lock record
    pub force: bool,
    /// Label stored in the lock record
    pub mode: String,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_iterations: None,
            force: false,
            mode: "run".to_string(),
        }
    }
}

/// Run the loop with real signal handlers installed; returns the process exit code
pub async fn run(mut config: Config, options: RunOptions) -> Result<i32> {
    debug!(?options, "run: called");
    if let Some(max) = options.max_iterations {
        config.run_loop.max_iterations = max;
    }
    config.validate().context("Invalid configuration")?;

    let coordinator = SignalCoordinator::new(
        CleanupRegistry::new(),
        ChildTracker::new(),
        config.shutdown.cleanup_timeout(),
        config.shutdown.kill_grace(),
    );
    let mut handlers = coordinator.install().context("Failed to install signal handlers")?;

    let code = run_with(&config, &options, &coordinator).await;
    if coordinator.is_shutting_down() {
        // The handler owns the exit; let it finish reaping and draining
        let bound = coordinator.cleanup_timeout() + coordinator.kill_grace() + HANDLER_SLACK;
        debug!(?bound, "run: waiting for signal handler");
        if tokio::time::timeout(bound, &mut handlers).await.is_err() {
            warn!("Signal handler did not finish in time");
            handlers.abort();
        }
    } else {
        handlers.abort();
    }
    code
}

/// Run the loop under `coordinator`. Signal delivery is the caller's business.
pub async fn run_with(config: &Config, options: &RunOptions, coordinator: &SignalCoordinator) -> Result<i32> {
    debug!(mode = %options.mode, force = options.force, "run_with: called");
    let registry = coordinator.registry().clone();
    let process = ProcessInfo::current();
    let lock = LockManager::new(config.project.lock_path());

    match lock.acquire(&process, &options.mode, options.force) {
        Ok(_) => {}
        Err(e @ LockError::AlreadyRunning { .. }) => {
            warn!(error = %e, "Lock held by another run");
            eprintln!("{} {}", "Error:".red(), e);
            return Ok(EXIT_ALREADY_RUNNING);
        }
        Err(e) => return Err(e).context("Failed to acquire lock"),
    }

    {
        let lock = lock.clone();
        let pid = process.pid;
        registry.register_sync("release lock", move || {
            lock.release(pid)?;
            Ok(())
        });
    }

    let log = RunLog::open(&config.project.log_path());
    log.info(
        "run.start",
        format!("pid={} mode={} version={}", process.pid, options.mode, env!("GIT_DESCRIBE")),
    );
    {
        let log = log.clone();
        registry.register_sync("flush run log", move || {
            log.info("run.cleanup", "releasing lock");
            log.flush();
            Ok(())
        });
    }

    let supervisor = ProcessSupervisor::new(coordinator.children().clone(), coordinator.kill_grace());
    let root = config.project.root.clone();
    let dispatcher = WorkerDispatcher::new(
        config.worker.clone(),
        RetryPolicy::from_config(&config.retry),
        supervisor.clone(),
        root.clone(),
        config.project.state_path(),
    );
    let gates = GateRunner::new(supervisor, root, config.gates.timeout()).with_stop_flag(coordinator.shutdown_flag());

    let mut orchestrator = Orchestrator::new(dispatcher, gates, LoopSettings::from_config(config), log)
        .with_lock(LockBinding {
            manager: lock,
            pid: process.pid,
        })
        .with_stop_flag(coordinator.shutdown_flag());
    let outcome = orchestrator.run().await;
    print_summary(&outcome);

    if coordinator.is_shutting_down() {
        debug!("run_with: cleanup left to the shutdown path");
    } else {
        let report = registry.drain(coordinator.cleanup_timeout()).await;
        if !report.failed.is_empty() || report.timed_out {
            warn!(failed = ?report.failed, timed_out = report.timed_out, "Cleanup incomplete");
        }
    }
    // A delivered signal decides the code, whatever state the loop stopped in
    let code = coordinator
        .received()
        .map(ShutdownSignal::exit_code)
        .unwrap_or_else(|| outcome.exit_code());
    info!(exit_code = code, "Run finished");
    Ok(code)
}

fn print_summary(outcome: &LoopOutcome) {
    let mark = match (&outcome.reason, outcome.exit_code()) {
        (StopReason::Interrupted, _) => "!".yellow(),
        (_, 0) => "✓".green(),
        _ => "✗".red(),
    };
    println!(
        "{} {} after {} iteration(s), {} worker dispatch(es), {} gate run(s)",
        mark, outcome.reason, outcome.iterations, outcome.dispatches, outcome.gate_runs
    );
    if matches!(outcome.reason, StopReason::MaxIterations) {
        println!("  Work remains; run again or raise --max-iterations");
    }
    if outcome.gates_exhausted {
        println!("  Gates were still failing at the last iteration");
    }
}
