//! CLI command definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::debug;

/// taskloop - single-project agent loop orchestrator
#[derive(Parser)]
#[command(
    name = "tl",
    about = "Drive a worker through a task table until every task is done",
    version = env!("GIT_DESCRIBE"),
    after_help = after_help()
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the loop until the task table is done
    Run {
        /// Maximum iterations (overrides loop.max-iterations)
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Take the lock even if another run holds it
        #[arg(long)]
        force: bool,

        /// Label recorded in the lock file
        #[arg(long, default_value = "run")]
        mode: String,
    },

    /// Show task table state and the lock holder
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Run the configured gates once
    Gates,

    /// Remove a lock left behind by a run that is no longer alive
    Unlock {
        /// Remove the lock even if its holder is still running
        #[arg(long)]
        force: bool,
    },
}

/// Output format for the status command
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Get the diagnostic log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("taskloop")
        .join("logs")
        .join("taskloop.log")
}

fn after_help() -> String {
    format!(
        "Exit codes: 0 done or clean stop, 1 failure, 130 interrupted, 143 terminated\n\
         Logs are written to: {}",
        get_log_path().display()
    )
}
