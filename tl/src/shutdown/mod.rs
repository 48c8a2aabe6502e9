//! Shutdown coordination: cleanup registry, child tracking, signal handling

mod children;
mod registry;
mod signals;

pub use children::{ChildTracker, TrackedChild, is_process_running};
pub use registry::{CleanupFuture, CleanupRegistry, DrainReport, HandlerId};
pub use signals::{EXIT_INTERRUPTED, EXIT_TERMINATED, ShutdownSignal, SignalCoordinator};
