//! StateEngine - cached reads of the task table

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::parse::{self, OrchestrationState, TaskRow, TaskStats};

/// Default reuse window for a read
pub const DEFAULT_STATE_TTL: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    /// Ignore any cached read
    pub force_refresh: bool,
    pub ttl: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            ttl: DEFAULT_STATE_TTL,
        }
    }
}

impl QueryOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            force_refresh: false,
            ttl,
        }
    }
}

/// Everything one query answers, computed from a single read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub state: OrchestrationState,
    pub stats: TaskStats,
    pub active_item: Option<TaskRow>,
}

impl StateSnapshot {
    fn from_lines(lines: Option<&[String]>) -> Self {
        let Some(lines) = lines else {
            return Self {
                state: OrchestrationState::NoState,
                stats: TaskStats::default(),
                active_item: None,
            };
        };
        let rows = parse::task_rows(lines);
        Self {
            state: parse::classify(&lines.join("\n")),
            stats: parse::stats(&rows),
            active_item: parse::active_item(&rows).cloned(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    path: PathBuf,
    /// `None` records that the artifact was absent
    lines: Option<Arc<Vec<String>>>,
    captured_at: Instant,
}

/// Owns the read cache; one per orchestrator
#[derive(Debug, Default)]
pub struct StateEngine {
    cache: Option<CacheEntry>,
}

impl StateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the cached read
    pub fn invalidate(&mut self) {
        debug!("StateEngine::invalidate: called");
        self.cache = None;
    }

    /// Read (or reuse) the artifact and derive state, stats and active item
    pub fn query(&mut self, path: &Path, opts: QueryOptions) -> Result<StateSnapshot, StateError> {
        debug!(?path, force_refresh = opts.force_refresh, ttl = ?opts.ttl, "StateEngine::query: called");
        let lines = self.lines(path, opts)?;
        Ok(StateSnapshot::from_lines(lines.as_deref().map(Vec::as_slice)))
    }

    pub fn state(&mut self, path: &Path, opts: QueryOptions) -> Result<OrchestrationState, StateError> {
        Ok(self.query(path, opts)?.state)
    }

    pub fn stats(&mut self, path: &Path, opts: QueryOptions) -> Result<TaskStats, StateError> {
        Ok(self.query(path, opts)?.stats)
    }

    pub fn active_item(&mut self, path: &Path, opts: QueryOptions) -> Result<Option<TaskRow>, StateError> {
        Ok(self.query(path, opts)?.active_item)
    }

    fn lines(&mut self, path: &Path, opts: QueryOptions) -> Result<Option<Arc<Vec<String>>>, StateError> {
        if !opts.force_refresh
            && let Some(entry) = &self.cache
            && entry.path == path
            && entry.captured_at.elapsed() < opts.ttl
        {
            debug!("StateEngine::lines: cache hit");
            return Ok(entry.lines.clone());
        }

        let lines = match std::fs::read_to_string(path) {
            Ok(content) => Some(Arc::new(content.lines().map(str::to_string).collect::<Vec<_>>())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(?path, "StateEngine::lines: state file absent");
                None
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        debug!(count = lines.as_ref().map(|l| l.len()), "StateEngine::lines: read from disk");

        self.cache = Some(CacheEntry {
            path: path.to_path_buf(),
            lines: lines.clone(),
            captured_at: Instant::now(),
        });
        Ok(lines)
    }
}
