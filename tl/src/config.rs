//! taskloop configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::StdioMode;
use crate::worker::{Phase, PhaseTable};

/// Main taskloop configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project layout: state artifact, lock file, run log
    pub project: ProjectConfig,

    /// External worker invocation
    pub worker: WorkerConfig,

    /// Worker retry policy
    pub retry: RetryConfig,

    /// Validation gates run after the implement phase
    pub gates: GatesConfig,

    /// Orchestration loop bounds
    #[serde(rename = "loop")]
    pub run_loop: LoopConfig,

    /// Cleanup and child termination bounds
    pub shutdown: ShutdownConfig,

    /// Log level for the diagnostic log (overridden by --log-level)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.worker.command.trim().is_empty() {
            return Err(eyre::eyre!("worker.command is empty. Set it to the worker executable to run."));
        }
        if self.run_loop.max_iterations == 0 {
            return Err(eyre::eyre!("loop.max-iterations must be at least 1"));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(eyre::eyre!("retry.base-delay-ms must be greater than 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(eyre::eyre!(
                "retry.max-delay-ms ({}) is smaller than retry.base-delay-ms ({})",
                self.retry.max_delay_ms,
                self.retry.base_delay_ms
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .taskloop.yml
        let local_config = PathBuf::from(".taskloop.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/taskloop/taskloop.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("taskloop").join("taskloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only `log-level`, before logging is set up; any failure yields `None`
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let candidates = match config_path {
            Some(path) => vec![path.clone()],
            None => {
                let mut paths = vec![PathBuf::from(".taskloop.yml")];
                if let Some(config_dir) = dirs::config_dir() {
                    paths.push(config_dir.join("taskloop").join("taskloop.yml"));
                }
                paths
            }
        };
        candidates
            .iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .find_map(|content| serde_yaml::from_str::<Self>(&content).ok())
            .and_then(|config| config.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Project layout; relative paths resolve against `root`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project root; the worker and gate commands run here
    pub root: PathBuf,

    /// Task table the loop reads its state from
    #[serde(rename = "state-file")]
    pub state_file: PathBuf,

    /// Single-instance lock record
    #[serde(rename = "lock-file")]
    pub lock_file: PathBuf,

    /// Append-only run log
    #[serde(rename = "log-file")]
    pub log_file: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            state_file: PathBuf::from("IMPLEMENTATION_PLAN.md"),
            lock_file: PathBuf::from(".taskloop/loop.lock"),
            log_file: PathBuf::from(".taskloop/loop.log"),
        }
    }
}

impl ProjectConfig {
    /// Resolve `path` against the project root unless it is absolute
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.resolve(&self.state_file)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.resolve(&self.lock_file)
    }

    pub fn log_path(&self) -> PathBuf {
        self.resolve(&self.log_file)
    }
}

/// External worker invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker executable, looked up on PATH unless it contains a slash
    pub command: String,

    /// Agent identifier per phase (defaults: implementer, fixer, reviewer, tidier)
    pub agents: PhaseTable<Option<String>>,

    /// Default model name
    pub model: String,

    /// Per-phase model overrides
    pub models: PhaseTable<Option<String>>,

    /// Flag that skips interactive permission prompts (empty to omit)
    #[serde(rename = "permission-flag")]
    pub permission_flag: String,

    /// Flag that makes the worker run one-shot (empty to omit)
    #[serde(rename = "non-interactive-flag")]
    pub non_interactive_flag: String,

    /// Appended verbatim after the generated arguments
    #[serde(rename = "extra-args")]
    pub extra_args: Vec<String>,

    /// inherit or piped
    pub stdio: StdioMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            agents: PhaseTable::default(),
            model: "sonnet".to_string(),
            models: PhaseTable::default(),
            permission_flag: "--dangerously-skip-permissions".to_string(),
            non_interactive_flag: "--print".to_string(),
            extra_args: Vec::new(),
            stdio: StdioMode::Inherit,
        }
    }
}

impl WorkerConfig {
    pub fn agent_for(&self, phase: Phase) -> &str {
        self.agents.get(phase).as_deref().unwrap_or(match phase {
            Phase::Implement => "implementer",
            Phase::Fix => "fixer",
            Phase::Review => "reviewer",
            Phase::Tidy => "tidier",
        })
    }

    pub fn model_for(&self, phase: Phase) -> &str {
        self.models.get(phase).as_deref().unwrap_or(&self.model)
    }
}

/// Worker retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Additional attempts after the first
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "base-delay-ms")]
    pub base_delay_ms: u64,

    #[serde(rename = "max-delay-ms")]
    pub max_delay_ms: u64,

    /// Exit codes treated as transient
    #[serde(rename = "retryable-exit-codes")]
    pub retryable_exit_codes: Vec<i32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            // DNS, connect, curl timeout, recv failure, EX_TEMPFAIL, timeout(1)
            retryable_exit_codes: vec![6, 7, 28, 56, 75, 124],
        }
    }
}

/// Validation gates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    /// Shell commands, run in order
    pub commands: Vec<String>,

    /// Per-command timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_ms: 300_000,
        }
    }
}

impl GatesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Orchestration loop bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Fix dispatches per iteration after a gate failure
    #[serde(rename = "max-fix-attempts")]
    pub max_fix_attempts: u32,

    /// How long a state read is reused
    #[serde(rename = "state-ttl-ms")]
    pub state_ttl_ms: u64,

    /// Pause between iterations
    #[serde(rename = "pause-ms")]
    pub pause_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_fix_attempts: 3,
            state_ttl_ms: 200,
            pause_ms: 1000,
        }
    }
}

/// Cleanup and child termination bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Ceiling on running all cleanup callbacks
    #[serde(rename = "cleanup-timeout-ms")]
    pub cleanup_timeout_ms: u64,

    /// Wait between SIGTERM and SIGKILL for children
    #[serde(rename = "kill-grace-ms")]
    pub kill_grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            cleanup_timeout_ms: 5000,
            kill_grace_ms: 2000,
        }
    }
}

impl ShutdownConfig {
    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}
