//! taskloop - single-project agent loop orchestrator
//!
//! taskloop reads a human-editable task table, dispatches an external worker
//! for whichever phase the table calls for, validates the result with gate
//! commands, and repeats until every task is done. One run per project is
//! enforced with a lock file; signals tear the run down cleanly.
//!
//! # Modules
//!
//! - [`state`] - Task table parsing and cached state queries
//! - [`worker`] - Worker argument construction, retry policy, dispatch
//! - [`gates`] - Sequential validation commands
//! - [`lock`] - Single-instance lock record
//! - [`orchestrator`] - The iteration loop and run log
//! - [`shutdown`] - Cleanup registry, child tracking, signal handling
//! - [`process`] - Spawning and supervising one child process
//! - [`fs_atomic`] - Crash-safe file writes
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod fs_atomic;
pub mod gates;
pub mod lock;
pub mod orchestrator;
pub mod process;
pub mod run;
pub mod shutdown;
pub mod state;
pub mod worker;
