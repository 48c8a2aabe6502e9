//! The orchestration loop and its run log

mod engine;
mod run_log;

pub use engine::{LockBinding, LoopOutcome, LoopSettings, Orchestrator, StopReason};
pub use run_log::RunLog;
