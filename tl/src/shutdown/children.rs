//! Tracking of live child processes so shutdown can reap them

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

/// A child registered by the process supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedChild {
    pub pid: u32,
    /// Child leads its own process group; signals go to the whole group
    pub process_group: bool,
}

impl TrackedChild {
    /// Deliver `signal` to the child (or its group). Returns false if it is already gone.
    pub fn signal(&self, signal: Signal) -> bool {
        let pid = Pid::from_raw(self.pid as i32);
        let result = if self.process_group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        match result {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!(pid = self.pid, ?signal, error = %e, "TrackedChild::signal: failed");
                false
            }
        }
    }
}

#[derive(Debug, Default)]
struct Entries {
    children: HashMap<u32, TrackedChild>,
    /// Set once shutdown begins; no new children may be tracked after that
    closed: bool,
}

/// Registry of children that are currently being awaited
#[derive(Debug, Clone, Default)]
pub struct ChildTracker {
    inner: Arc<Mutex<Entries>>,
}

impl ChildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a spawned child. Returns false, without registering it, once
    /// the tracker has been closed; the caller owns killing that child.
    pub fn track(&self, child: TrackedChild) -> bool {
        debug!(pid = child.pid, process_group = child.process_group, "ChildTracker::track: called");
        let mut entries = self.entries();
        if entries.closed {
            warn!(pid = child.pid, "ChildTracker::track: refused, shutdown in progress");
            return false;
        }
        entries.children.insert(child.pid, child);
        true
    }

    pub fn untrack(&self, pid: u32) {
        debug!(pid, "ChildTracker::untrack: called");
        self.entries().children.remove(&pid);
    }

    /// Refuse all further `track` calls
    pub fn close(&self) {
        debug!("ChildTracker::close: called");
        self.entries().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.entries().closed
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries().children.contains_key(&pid)
    }

    pub fn snapshot(&self) -> Vec<TrackedChild> {
        self.entries().children.values().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().children.is_empty()
    }

    /// SIGTERM every tracked child, wait up to `grace` for them to be reaped,
    /// then SIGKILL whatever remains. Returns how many needed the kill.
    pub async fn terminate_all(&self, grace: Duration) -> usize {
        self.close();
        let children = self.snapshot();
        debug!(count = children.len(), ?grace, "ChildTracker::terminate_all: called");
        if children.is_empty() {
            return 0;
        }

        for child in &children {
            info!(pid = child.pid, "Sending SIGTERM to child");
            child.signal(Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if children.iter().all(|c| !self.is_live(c)) {
                debug!("ChildTracker::terminate_all: all children exited");
                return 0;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut killed = 0;
        for child in &children {
            if self.is_live(child) {
                warn!(pid = child.pid, "Child ignored SIGTERM, sending SIGKILL");
                child.signal(Signal::SIGKILL);
                killed += 1;
            } else if child.process_group {
                // Leader is gone but stragglers in its group may not be
                child.signal(Signal::SIGKILL);
            }
        }
        killed
    }

    /// SIGKILL everything immediately; used when the operator forces exit
    pub fn kill_all(&self) {
        self.close();
        for child in self.snapshot() {
            warn!(pid = child.pid, "Force-killing child");
            child.signal(Signal::SIGKILL);
        }
    }

    fn is_live(&self, child: &TrackedChild) -> bool {
        // Untracked means the supervisor already reaped it
        self.contains(child.pid) && is_process_running(child.pid)
    }
}

/// Check if a process with the given PID exists
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // Signal 0 checks existence without delivering anything
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
