//! Worker argument vector construction

use crate::config::WorkerConfig;

use super::Phase;

/// Build the worker's argv (excluding the program) for `phase`.
///
/// Order: agent, permission flag, model, non-interactive flag, extra args.
pub fn build_agent_args(worker: &WorkerConfig, phase: Phase) -> Vec<String> {
    let mut args = vec!["--agent".to_string(), worker.agent_for(phase).to_string()];

    if !worker.permission_flag.is_empty() {
        args.push(worker.permission_flag.clone());
    }

    args.push("--model".to_string());
    args.push(worker.model_for(phase).to_string());

    if !worker.non_interactive_flag.is_empty() {
        args.push(worker.non_interactive_flag.clone());
    }

    args.extend(worker.extra_args.iter().cloned());
    args
}
