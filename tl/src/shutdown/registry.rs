//! Cleanup registry
//!
//! An owned, cloneable list of teardown callbacks. Callbacks run once, in
//! reverse registration order, and the whole drain is bounded by a timeout so
//! a hung callback can never keep the process alive.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

pub type CleanupFuture = Pin<Box<dyn Future<Output = eyre::Result<()>> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send>;

/// Handle returned by registration, used to unregister a single callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry {
    id: HandlerId,
    name: String,
    handler: CleanupFn,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// What happened during a drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Callbacks that ran to completion (successfully or not)
    pub ran: usize,
    /// Names of callbacks that returned an error
    pub failed: Vec<String>,
    /// Callbacks that never ran because the timeout fired
    pub abandoned: usize,
    pub timed_out: bool,
}

#[derive(Clone, Default)]
pub struct CleanupRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry").field("pending", &self.len()).finish()
    }
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an asynchronous callback
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = HandlerId(inner.next_id);
        debug!(%name, ?id, "CleanupRegistry::register: called");
        inner.entries.push(Entry {
            id,
            name,
            handler: Box::new(move || Box::pin(handler()) as CleanupFuture),
        });
        id
    }

    /// Register a synchronous callback
    pub fn register_sync<F>(&self, name: impl Into<String>, handler: F) -> HandlerId
    where
        F: FnOnce() -> eyre::Result<()> + Send + 'static,
    {
        self.register(name, move || async move { handler() })
    }

    /// Remove one callback without running it. Returns false if it was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut inner = self.inner();
        let before = inner.entries.len();
        inner.entries.retain(|entry| entry.id != id);
        let removed = inner.entries.len() != before;
        debug!(?id, removed, "CleanupRegistry::unregister: called");
        removed
    }

    /// Drop every callback without running any
    pub fn clear(&self) {
        debug!("CleanupRegistry::clear: called");
        self.inner().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run all callbacks last-registered-first, bounded by `timeout`.
    ///
    /// Callbacks are taken out of the registry first, so concurrent or repeated
    /// drains never run a callback twice.
    pub async fn drain(&self, timeout: Duration) -> DrainReport {
        let entries = std::mem::take(&mut self.inner().entries);
        let total = entries.len();
        debug!(total, ?timeout, "CleanupRegistry::drain: called");

        let mut report = DrainReport::default();
        let run_all = async {
            for entry in entries.into_iter().rev() {
                debug!(name = %entry.name, "CleanupRegistry::drain: running callback");
                if let Err(e) = (entry.handler)().await {
                    warn!(name = %entry.name, error = %e, "Cleanup callback failed");
                    report.failed.push(entry.name);
                }
                report.ran += 1;
            }
        };

        if tokio::time::timeout(timeout, run_all).await.is_err() {
            report.timed_out = true;
            report.abandoned = total - report.ran;
            warn!(
                ran = report.ran,
                abandoned = report.abandoned,
                "Cleanup timed out after {:?}, abandoning remaining callbacks",
                timeout
            );
        } else {
            info!(ran = report.ran, failed = report.failed.len(), "Cleanup complete");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = Box<dyn FnOnce() -> eyre::Result<()> + Send>;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Callback) {
        let order = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let order = order.clone();
            move |name: &'static str| {
                let order = order.clone();
                Box::new(move || {
                    order.lock().unwrap().push(name);
                    Ok(())
                }) as Callback
            }
        };
        (order, make)
    }

    #[tokio::test]
    async fn test_drain_runs_in_reverse_order() {
        let registry = CleanupRegistry::new();
        let (order, make) = recorder();

        registry.register_sync("release lock", make("release lock"));
        registry.register_sync("flush log", make("flush log"));
        registry.register_sync("print summary", make("print summary"));

        let report = registry.drain(Duration::from_secs(1)).await;

        assert_eq!(report.ran, 3);
        assert!(!report.timed_out);
        assert_eq!(*order.lock().unwrap(), vec!["print summary", "flush log", "release lock"]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drain_twice_runs_callbacks_once() {
        let registry = CleanupRegistry::new();
        let (order, make) = recorder();
        registry.register_sync("once", make("once"));

        registry.drain(Duration::from_secs(1)).await;
        let second = registry.drain(Duration::from_secs(1)).await;

        assert_eq!(second.ran, 0);
        assert_eq!(order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_and_clear() {
        let registry = CleanupRegistry::new();
        let (order, make) = recorder();

        let a = registry.register_sync("a", make("a"));
        registry.register_sync("b", make("b"));
        assert!(registry.unregister(a));
        assert!(!registry.unregister(a));

        registry.drain(Duration::from_secs(1)).await;
        assert_eq!(*order.lock().unwrap(), vec!["b"]);

        registry.register_sync("c", make("c"));
        registry.clear();
        let report = registry.drain(Duration::from_secs(1)).await;
        assert_eq!(report.ran, 0);
    }

    #[tokio::test]
    async fn test_failing_callback_does_not_stop_drain() {
        let registry = CleanupRegistry::new();
        let (order, make) = recorder();

        registry.register_sync("first", make("first"));
        registry.register_sync("broken", || Err(eyre::eyre!("disk on fire")));

        let report = registry.drain(Duration::from_secs(1)).await;

        assert_eq!(report.ran, 2);
        assert_eq!(report.failed, vec!["broken".to_string()]);
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_hung_callback_is_abandoned_after_timeout() {
        let registry = CleanupRegistry::new();
        let (order, make) = recorder();

        registry.register_sync("never reached", make("never reached"));
        registry.register("hangs", || async {
            std::future::pending::<()>().await;
            Ok(())
        });

        let report = registry.drain(Duration::from_millis(100)).await;

        assert!(report.timed_out);
        assert_eq!(report.ran, 0);
        assert_eq!(report.abandoned, 2);
        assert!(order.lock().unwrap().is_empty());
    }
}
