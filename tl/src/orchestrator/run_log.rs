//! Append-only run log: one timestamped line per loop event
//!
//! Line format: `<rfc3339> <LEVEL> <event> <detail>`. If the file cannot be
//! opened the log becomes a no-op sink; the loop never fails because of it.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use tracing::{Level, debug, warn};

#[derive(Debug, Clone, Default)]
pub struct RunLog {
    writer: Arc<Mutex<Option<BufWriter<File>>>>,
}

impl RunLog {
    /// Open `path` for appending, creating parent directories
    pub fn open(path: &Path) -> Self {
        debug!(?path, "RunLog::open: called");
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
            && let Err(e) = fs::create_dir_all(parent)
        {
            warn!(?path, error = %e, "Run log directory unavailable, run log disabled");
            return Self::disabled();
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Self {
                writer: Arc::new(Mutex::new(Some(BufWriter::new(file)))),
            },
            Err(e) => {
                warn!(?path, error = %e, "Failed to open run log, run log disabled");
                Self::disabled()
            }
        }
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    pub fn event(&self, level: Level, event: &str, detail: impl AsRef<str>) {
        let Ok(mut guard) = self.writer.lock() else {
            return;
        };
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        // Keep one event per line
        let detail = detail.as_ref().replace('\n', " | ");
        if let Err(e) = writeln!(writer, "{} {} {} {}", timestamp, level, event, detail) {
            debug!(error = %e, "RunLog::event: write failed");
        }
    }

    pub fn info(&self, event: &str, detail: impl AsRef<str>) {
        self.event(Level::INFO, event, detail);
    }

    pub fn warn(&self, event: &str, detail: impl AsRef<str>) {
        self.event(Level::WARN, event, detail);
    }

    pub fn error(&self, event: &str, detail: impl AsRef<str>) {
        self.event(Level::ERROR, event, detail);
    }

    pub fn flush(&self) {
        let Ok(mut guard) = self.writer.lock() else {
            return;
        };
        if let Some(writer) = guard.as_mut()
            && let Err(e) = writer.flush()
        {
            warn!(error = %e, "Failed to flush run log");
        }
    }
}
