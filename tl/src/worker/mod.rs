//! Worker dispatch: argument construction, retry policy, and the dispatcher

mod args;
mod dispatcher;
mod retry;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use args::build_agent_args;
pub use dispatcher::{AgentResult, PhaseContext, PhaseRunner, WorkerDispatcher};
pub use retry::{ExitClass, RetryAttempt, RetryPolicy};

/// Named worker invocation, one per orchestrator state that needs work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Implement,
    Fix,
    Review,
    Tidy,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Implement, Phase::Fix, Phase::Review, Phase::Tidy];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Implement => "implement",
            Phase::Fix => "fix",
            Phase::Review => "review",
            Phase::Tidy => "tidy",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTable<T> {
    pub implement: T,
    pub fix: T,
    pub review: T,
    pub tidy: T,
}

impl<T> PhaseTable<T> {
    pub fn get(&self, phase: Phase) -> &T {
        match phase {
            Phase::Implement => &self.implement,
            Phase::Fix => &self.fix,
            Phase::Review => &self.review,
            Phase::Tidy => &self.tidy,
        }
    }
}
