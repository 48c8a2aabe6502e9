//! Task table state detection

mod engine;
mod parse;

pub use engine::{DEFAULT_STATE_TTL, QueryOptions, StateEngine, StateError, StateSnapshot};
pub use parse::{OrchestrationState, TaskRow, TaskStats, TaskStatus, classify, parse_row};
