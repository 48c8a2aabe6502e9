//! taskloop - single-project agent loop orchestrator
//!
//! CLI entry point.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use taskloop::cli::{Cli, Command, OutputFormat, get_log_path};
use taskloop::config::Config;
use taskloop::gates::GateRunner;
use taskloop::lock::{LockManager, LockStatus, format_elapsed};
use taskloop::process::ProcessSupervisor;
use taskloop::run::{RunOptions, run};
use taskloop::shutdown::ChildTracker;
use taskloop::state::{QueryOptions, StateEngine, StateSnapshot};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    let code = match cli.command {
        Command::Run {
            max_iterations,
            force,
            mode,
        } => {
            debug!(?max_iterations, force, %mode, "main: matched Run command");
            let options = RunOptions {
                max_iterations,
                force,
                mode,
            };
            run(config, options).await?
        }
        Command::Status { format } => {
            debug!(?format, "main: matched Status command");
            cmd_status(&config, format)?
        }
        Command::Gates => {
            debug!("main: matched Gates command");
            cmd_gates(&config).await
        }
        Command::Unlock { force } => {
            debug!(force, "main: matched Unlock command");
            cmd_unlock(&config, force)?
        }
    };

    info!(code, "Exiting");
    std::process::exit(code);
}

/// Show task table state and the lock holder
fn cmd_status(config: &Config, format: OutputFormat) -> Result<i32> {
    debug!(?format, "cmd_status: called");
    let state_path = config.project.state_path();
    let snapshot = StateEngine::new()
        .query(&state_path, QueryOptions::refresh())
        .context("Failed to read task table")?;
    let lock = LockManager::new(config.project.lock_path())
        .status()
        .context("Failed to read lock")?;

    match format {
        OutputFormat::Json => {
            let report = serde_json::json!({
                "state-file": state_path,
                "state": snapshot.state,
                "stats": snapshot.stats,
                "active-item": snapshot.active_item,
                "lock": lock.as_ref().map(|l| serde_json::json!({
                    "pid": l.record.pid,
                    "mode": l.record.mode,
                    "started-at": l.record.started_at,
                    "elapsed-secs": l.elapsed_secs(),
                    "iteration": l.record.iteration,
                    "state": l.record.state,
                    "owner-alive": l.owner_alive,
                })),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => print_status(&state_path, &snapshot, lock.as_ref()),
    }
    Ok(0)
}

fn print_status(state_path: &std::path::Path, snapshot: &StateSnapshot, lock: Option<&LockStatus>) {
    let stats = snapshot.stats;
    println!("{:<8} {}", "File:", state_path.display());
    println!("{:<8} {}", "State:", snapshot.state.to_string().bold());
    println!(
        "{:<8} {} total, {} complete, {} remaining, {} in review, {} blocked",
        "Tasks:", stats.total, stats.completed, stats.remaining, stats.in_review, stats.blocked
    );
    match &snapshot.active_item {
        Some(row) => println!(
            "{:<8} {} {} ({}, line {})",
            "Active:",
            row.id.cyan(),
            row.title,
            row.status.as_str(),
            row.line
        ),
        None => println!("{:<8} -", "Active:"),
    }
    match lock {
        None => println!("{:<8} {}", "Lock:", "free".green()),
        Some(status) => {
            let record = &status.record;
            let mut line = format!(
                "held by PID {} (mode {}, started {} ago",
                record.pid,
                record.mode,
                format_elapsed(&status.elapsed_secs())
            );
            if let Some(iteration) = record.iteration {
                line.push_str(&format!(", iteration {}", iteration));
            }
            if let Some(state) = &record.state {
                line.push_str(&format!(", state {}", state));
            }
            line.push(')');
            if status.is_stale() {
                println!("{:<8} {} {}", "Lock:", line.yellow(), "[stale: holder not running, see `tl unlock`]".red());
            } else {
                println!("{:<8} {}", "Lock:", line);
            }
        }
    }
}

/// Run the gates once and print per-command results
async fn cmd_gates(config: &Config) -> i32 {
    debug!("cmd_gates: called");
    if config.gates.commands.is_empty() {
        println!("No gates configured (gates.commands is empty)");
        return 0;
    }
    let supervisor = ProcessSupervisor::new(ChildTracker::new(), config.shutdown.kill_grace());
    let runner = GateRunner::new(supervisor, config.project.root.clone(), config.gates.timeout());

    let result = runner.run(&config.gates.commands).await;
    for command in &result.results {
        let mark = if command.is_success { "✓".green() } else { "✗".red() };
        println!(
            "{} {} (exit {}, {} ms)",
            mark, command.command, command.exit_code, command.duration_ms
        );
    }
    println!(
        "{}/{} gates passed in {} ms",
        result.passed_count(),
        result.results.len(),
        result.total_duration_ms
    );
    match &result.error {
        Some(error) => {
            eprintln!("\n{}", error);
            1
        }
        None => 0,
    }
}

/// Remove a lock whose holder is gone, or any lock with --force
fn cmd_unlock(config: &Config, force: bool) -> Result<i32> {
    debug!(force, "cmd_unlock: called");
    let lock = LockManager::new(config.project.lock_path());
    let status = match lock.status() {
        Ok(status) => status,
        Err(e) if force => {
            eprintln!("{} {}", "Warning:".yellow(), e);
            None
        }
        Err(e) => return Err(e).context("Failed to read lock"),
    };

    if status.is_none() && !lock.is_locked() {
        println!("No lock held");
        return Ok(0);
    }

    if let Some(status) = &status
        && status.owner_alive
        && !force
    {
        eprintln!(
            "{} PID {} is still running; stop it first or pass --force",
            "Refusing:".red(),
            status.record.pid
        );
        return Ok(1);
    }

    match lock.force_release().context("Failed to remove lock")? {
        Some(record) => println!("{} Removed lock held by PID {}", "✓".green(), record.pid),
        None => println!("{} Lock removed", "✓".green()),
    }
    Ok(0)
}
