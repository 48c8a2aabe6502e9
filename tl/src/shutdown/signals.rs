//! Signal coordination
//!
//! Turns SIGINT/SIGTERM into an orderly teardown: reap children, drain the
//! cleanup registry within the cleanup timeout, exit with a signal-derived
//! code. A second SIGINT while that is in progress SIGKILLs every child and
//! exits after at most a brief best-effort drain.

use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::children::ChildTracker;
use super::registry::CleanupRegistry;

/// Exit code for an interrupt (128 + SIGINT)
pub const EXIT_INTERRUPTED: i32 = 130;

/// Exit code for a termination request (128 + SIGTERM)
pub const EXIT_TERMINATED: i32 = 143;

/// Ceiling on the cleanup a forced exit still attempts (lock release, log flush)
const FORCED_CLEANUP_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Interrupt => EXIT_INTERRUPTED,
            ShutdownSignal::Terminate => EXIT_TERMINATED,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignalCoordinator {
    registry: CleanupRegistry,
    children: ChildTracker,
    cleanup_timeout: Duration,
    kill_grace: Duration,
    shutting_down: Arc<AtomicBool>,
    /// First signal delivered; later ones never overwrite it
    received: Arc<OnceLock<ShutdownSignal>>,
}

impl SignalCoordinator {
    pub fn new(registry: CleanupRegistry, children: ChildTracker, cleanup_timeout: Duration, kill_grace: Duration) -> Self {
        debug!(?cleanup_timeout, ?kill_grace, "SignalCoordinator::new: called");
        Self {
            registry,
            children,
            cleanup_timeout,
            kill_grace,
            shutting_down: Arc::new(AtomicBool::new(false)),
            received: Arc::new(OnceLock::new()),
        }
    }

    pub fn registry(&self) -> &CleanupRegistry {
        &self.registry
    }

    pub fn children(&self) -> &ChildTracker {
        &self.children
    }

    pub fn cleanup_timeout(&self) -> Duration {
        self.cleanup_timeout
    }

    pub fn kill_grace(&self) -> Duration {
        self.kill_grace
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// The signal that started shutdown, if any
    pub fn received(&self) -> Option<ShutdownSignal> {
        self.received.get().copied()
    }

    /// Flag that flips once shutdown starts, for loops that should stop taking new work
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutting_down)
    }

    /// Graceful teardown for `signal`; returns the exit code the process should use
    pub async fn shutdown(&self, signal: ShutdownSignal) -> i32 {
        debug!(signal = signal.name(), "SignalCoordinator::shutdown: called");
        let _ = self.received.set(signal);
        self.shutting_down.store(true, Ordering::SeqCst);
        self.children.close();
        warn!("{} received, shutting down", signal.name());

        let killed = self.children.terminate_all(self.kill_grace).await;
        if killed > 0 {
            warn!(killed, "Children had to be force-killed");
        }

        let report = self.registry.drain(self.cleanup_timeout).await;
        info!(
            ran = report.ran,
            failed = report.failed.len(),
            abandoned = report.abandoned,
            "Shutdown cleanup finished"
        );
        signal.exit_code()
    }

    /// Install SIGINT/SIGTERM handlers. On delivery the handler task runs
    /// [`shutdown`](Self::shutdown) and exits the process.
    #[cfg(unix)]
    pub fn install(&self) -> eyre::Result<JoinHandle<()>> {
        use tokio::signal::unix::{SignalKind, signal};

        debug!("SignalCoordinator::install: called");
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let coordinator = self.clone();

        Ok(tokio::spawn(async move {
            let received = tokio::select! {
                _ = sigint.recv() => ShutdownSignal::Interrupt,
                _ = sigterm.recv() => ShutdownSignal::Terminate,
            };

            let graceful = coordinator.shutdown(received);
            tokio::pin!(graceful);

            let code = match received {
                ShutdownSignal::Interrupt => tokio::select! {
                    code = &mut graceful => code,
                    _ = sigint.recv() => {
                        error!("Second SIGINT received, killing children and exiting");
                        coordinator.children.kill_all();
                        coordinator.registry.drain(FORCED_CLEANUP_TIMEOUT).await;
                        received.exit_code()
                    }
                },
                ShutdownSignal::Terminate => graceful.await,
            };

            std::process::exit(code);
        }))
    }

    #[cfg(not(unix))]
    pub fn install(&self) -> eyre::Result<JoinHandle<()>> {
        debug!("SignalCoordinator::install: called (ctrl_c only)");
        let coordinator = self.clone();
        Ok(tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let code = coordinator.shutdown(ShutdownSignal::Interrupt).await;
                std::process::exit(code);
            }
        }))
    }
}
