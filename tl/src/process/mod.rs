//! External process supervision

mod supervisor;

pub use supervisor::{
    CommandSpec, NOT_FOUND_EXIT_CODE, ProcessOutcome, ProcessSupervisor, StdioMode, SupervisorError,
    TIMEOUT_EXIT_CODE, UNKNOWN_EXIT_CODE, tail_lines,
};
