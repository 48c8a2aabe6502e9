//! LockManager - single-instance lock backed by a JSON lock record
//!
//! The record is created with [`atomic_create`], so two racing `acquire` calls
//! cannot both succeed. Read-modify-write operations (update, release, forced
//! acquire) are additionally serialized through an advisory `flock` on a
//! sibling `.guard` file. Staleness is reported, never acted on.
//!
//! `<lock>.guard` is a permanent sidecar: it is created on first use and is
//! never removed, not by `release`, `force_release` or `tl unlock`. Unlinking
//! a file other processes may hold or be about to `flock` would let two of
//! them lock different inodes under the same name. It carries no data; only
//! the lock record's presence means the lock is held.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fs_atomic::{AtomicWriteError, atomic_create, atomic_write};
use crate::shutdown::is_process_running;

/// Persisted descriptor of the process holding the lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Free-form run mode label, e.g. "run"
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl LockRecord {
    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// Identity of the process asking for the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

impl ProcessInfo {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now(),
        }
    }
}

/// Lock record plus liveness advisory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStatus {
    pub record: LockRecord,
    pub owner_alive: bool,
}

impl LockStatus {
    /// The recorded owner is no longer running
    pub fn is_stale(&self) -> bool {
        !self.owner_alive
    }

    pub fn elapsed_secs(&self) -> i64 {
        self.record.elapsed_secs()
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "taskloop is already running for this project (PID {pid}, mode '{mode}', started {} ago){}",
        format_elapsed(.elapsed_secs),
        stale_hint(.owner_alive)
    )]
    AlreadyRunning {
        pid: u32,
        mode: String,
        started_at: DateTime<Utc>,
        elapsed_secs: i64,
        owner_alive: bool,
    },

    #[error("Lock file {path} is corrupt: {reason}. Inspect it, then remove it with `tl unlock --force`")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Lock is not held by PID {pid}")]
    NotOwner { pid: u32 },

    #[error(transparent)]
    Write(#[from] AtomicWriteError),

    #[error("Lock file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn stale_hint(owner_alive: &bool) -> &'static str {
    if *owner_alive {
        ""
    } else {
        ". That process is no longer running; remove the stale lock with `tl unlock` or start with `tl run --force`"
    }
}

/// Render a duration in seconds as e.g. `1h 4m`, `3m 12s`, `9s`
pub fn format_elapsed(secs: &i64) -> String {
    let secs = (*secs).max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Holds the guard `flock` until dropped
struct Guard {
    file: File,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(error = %e, "Guard::drop: unlock failed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".guard");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn guard(&self) -> Result<Guard, LockError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.guard_path())
            .map_err(|e| self.io_error(e))?;
        FileExt::lock_exclusive(&file).map_err(|e| self.io_error(e))?;
        Ok(Guard { file })
    }

    /// Take the lock for `process`. With `force`, an existing record is replaced.
    pub fn acquire(&self, process: &ProcessInfo, mode: &str, force: bool) -> Result<LockRecord, LockError> {
        debug!(path = ?self.path, pid = process.pid, %mode, force, "LockManager::acquire: called");
        let _guard = self.guard()?;

        let record = LockRecord {
            pid: process.pid,
            started_at: process.started_at,
            mode: mode.to_string(),
            iteration: None,
            state: None,
        };
        let content = serde_json::to_vec_pretty(&record).map_err(|e| LockError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        if force {
            if let Ok(Some(previous)) = self.lock_info() {
                warn!(previous_pid = previous.pid, "Forcing lock acquisition over existing record");
            }
            atomic_write(&self.path, &content)?;
            info!(pid = process.pid, %mode, "Lock acquired (forced)");
            return Ok(record);
        }

        match atomic_create(&self.path, &content) {
            Ok(()) => {
                info!(pid = process.pid, %mode, "Lock acquired");
                Ok(record)
            }
            Err(AtomicWriteError::AlreadyExists { .. }) => {
                let holder = self.lock_info()?.ok_or_else(|| LockError::Corrupt {
                    path: self.path.clone(),
                    reason: "lock file vanished while being read".to_string(),
                })?;
                let owner_alive = is_process_running(holder.pid);
                debug!(holder_pid = holder.pid, owner_alive, "LockManager::acquire: already held");
                Err(LockError::AlreadyRunning {
                    pid: holder.pid,
                    mode: holder.mode.clone(),
                    started_at: holder.started_at,
                    elapsed_secs: holder.elapsed_secs(),
                    owner_alive,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pure read: a lock record exists
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Pure read of the current record
    pub fn lock_info(&self) -> Result<Option<LockRecord>, LockError> {
        debug!(path = ?self.path, "LockManager::lock_info: called");
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LockError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Current record with an owner liveness check
    pub fn status(&self) -> Result<Option<LockStatus>, LockError> {
        Ok(self.lock_info()?.map(|record| {
            let owner_alive = is_process_running(record.pid);
            LockStatus { record, owner_alive }
        }))
    }

    /// Record what the owning run is doing; only the owner may update
    pub fn update(&self, pid: u32, iteration: u32, state: &str) -> Result<(), LockError> {
        debug!(pid, iteration, %state, "LockManager::update: called");
        let _guard = self.guard()?;
        let mut record = match self.lock_info()? {
            Some(record) if record.pid == pid => record,
            _ => return Err(LockError::NotOwner { pid }),
        };
        record.iteration = Some(iteration);
        record.state = Some(state.to_string());
        let content = serde_json::to_vec_pretty(&record).map_err(|e| LockError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    /// Remove the lock if `pid` owns it. Returns whether a record was removed.
    ///
    /// Releasing an absent lock is not an error; a lock owned by someone else
    /// is left in place.
    pub fn release(&self, pid: u32) -> Result<bool, LockError> {
        debug!(path = ?self.path, pid, "LockManager::release: called");
        let _guard = self.guard()?;
        match self.lock_info()? {
            None => {
                debug!("LockManager::release: already released");
                Ok(false)
            }
            Some(record) if record.pid != pid => {
                warn!(owner = record.pid, pid, "Not releasing lock held by another process");
                Ok(false)
            }
            Some(_) => {
                self.remove_record()?;
                info!(pid, "Lock released");
                Ok(true)
            }
        }
    }

    /// Remove whatever record is present. Operator override only.
    pub fn force_release(&self) -> Result<Option<LockRecord>, LockError> {
        debug!(path = ?self.path, "LockManager::force_release: called");
        let _guard = self.guard()?;
        let previous = match self.lock_info() {
            Ok(record) => record,
            Err(LockError::Corrupt { reason, .. }) => {
                warn!(%reason, "Removing corrupt lock file");
                None
            }
            Err(e) => return Err(e),
        };
        self.remove_record()?;
        if let Some(record) = &previous {
            warn!(pid = record.pid, "Lock force-released");
        }
        Ok(previous)
    }

    fn remove_record(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error(e)),
        }
    }
}
