//! Crash-safe file replacement
//!
//! Content is written to a hidden sibling temp file, synced, then renamed over
//! the target. The target only ever holds the old bytes or the new bytes; a
//! failure at any step drops the temp file, which removes it from disk.

use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

/// Errors from [`atomic_write`] and [`atomic_create`], grouped by what the operator can do about them
#[derive(Debug, Error)]
pub enum AtomicWriteError {
    #[error("No space left on device while writing {path}")]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Permission denied writing {path}; check ownership of the directory")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write {path}: file system is read-only")]
    ReadOnly {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write {path}: parent directory does not exist")]
    MissingParent {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot create {path}: it already exists")]
    AlreadyExists {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl AtomicWriteError {
    fn classify(path: &Path, source: io::Error) -> Self {
        let path = path.to_path_buf();
        match source.kind() {
            ErrorKind::StorageFull => Self::DiskFull { path, source },
            ErrorKind::PermissionDenied => Self::PermissionDenied { path, source },
            ErrorKind::ReadOnlyFilesystem => Self::ReadOnly { path, source },
            ErrorKind::NotFound | ErrorKind::NotADirectory => Self::MissingParent { path, source },
            ErrorKind::AlreadyExists => Self::AlreadyExists { path, source },
            _ => Self::Io { path, source },
        }
    }

    /// Path that was being written
    pub fn path(&self) -> &Path {
        match self {
            Self::DiskFull { path, .. }
            | Self::PermissionDenied { path, .. }
            | Self::ReadOnly { path, .. }
            | Self::MissingParent { path, .. }
            | Self::AlreadyExists { path, .. }
            | Self::Io { path, .. } => path,
        }
    }
}

/// Replace `path` with `content` atomically
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), AtomicWriteError> {
    debug!(?path, len = content.len(), "atomic_write: called");
    let (tmp, parent) = write_temp(path, content)?;

    // On failure the PersistError still owns the temp file; dropping it unlinks it.
    tmp.persist(path).map_err(|e| {
        debug!(error = %e.error, "atomic_write: rename failed");
        AtomicWriteError::classify(path, e.error)
    })?;

    sync_parent_dir(&parent);
    debug!(?path, "atomic_write: done");
    Ok(())
}

/// Create `path` with `content` only if it does not exist yet.
///
/// The fully written temp file is linked into place, so of several racing
/// creators exactly one succeeds and the rest get [`AtomicWriteError::AlreadyExists`].
pub fn atomic_create(path: &Path, content: &[u8]) -> Result<(), AtomicWriteError> {
    debug!(?path, len = content.len(), "atomic_create: called");
    let (tmp, parent) = write_temp(path, content)?;

    tmp.persist_noclobber(path).map_err(|e| {
        debug!(error = %e.error, "atomic_create: link failed");
        AtomicWriteError::classify(path, e.error)
    })?;

    sync_parent_dir(&parent);
    debug!(?path, "atomic_create: done");
    Ok(())
}

/// Write and sync `content` into a hidden temp file beside `path`
fn write_temp(path: &Path, content: &[u8]) -> Result<(NamedTempFile, PathBuf), AtomicWriteError> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("taskloop");

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name))
        .suffix(".tmp")
        .tempfile_in(&parent)
        .map_err(|e| AtomicWriteError::classify(path, e))?;
    debug!(tmp = ?tmp.path(), "write_temp: temp file created");

    tmp.write_all(content)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| AtomicWriteError::classify(path, e))?;
    Ok((tmp, parent))
}

/// Convenience wrapper for textual artifacts
pub fn atomic_write_str(path: &Path, content: &str) -> Result<(), AtomicWriteError> {
    atomic_write(path, content.as_bytes())
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) {
    // Best effort: the rename is already visible, this only hardens it against power loss.
    if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
        debug!(?parent, error = %e, "sync_parent_dir: failed");
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_residue(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn test_write_empty_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.txt");

        atomic_write(&path, b"").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"");
        assert!(temp_residue(temp.path()).is_empty());
    }

    #[test]
    fn test_write_large_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("large.bin");
        let content: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

        atomic_write(&path, &content).unwrap();

        assert_eq!(fs::read(&path).unwrap(), content);
    }

    #[test]
    fn test_write_non_ascii_content() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plan.md");
        let content = "| T-1 | Übersetzung 翻訳 🚀 | DONE |\n";

        atomic_write_str(&path, content).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), content);
    }

    #[test]
    fn test_overwrites_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        fs::write(&path, "old").unwrap();

        atomic_write_str(&path, "new").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert!(temp_residue(temp.path()).is_empty());
    }

    #[test]
    fn test_failed_rename_leaves_target_and_no_residue() {
        let temp = TempDir::new().unwrap();
        // A non-empty directory at the target path blocks the rename
        let path = temp.path().join("blocked");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep.txt"), "untouched").unwrap();

        let err = atomic_write_str(&path, "replacement").unwrap_err();

        assert_eq!(err.path(), path.as_path());
        assert!(path.is_dir());
        assert_eq!(fs::read_to_string(path.join("keep.txt")).unwrap(), "untouched");
        assert!(temp_residue(temp.path()).is_empty());
    }

    #[test]
    fn test_missing_parent_is_classified() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("no").join("such").join("dir").join("file.txt");

        let err = atomic_write_str(&path, "x").unwrap_err();

        assert!(matches!(err, AtomicWriteError::MissingParent { .. }), "got {err:?}");
        assert!(err.to_string().contains("parent directory does not exist"));
        assert!(temp_residue(temp.path()).is_empty());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("loop.lock");

        atomic_create(&path, b"first").unwrap();
        let err = atomic_create(&path, b"second").unwrap_err();

        assert!(matches!(err, AtomicWriteError::AlreadyExists { .. }), "got {err:?}");
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
        assert!(temp_residue(temp.path()).is_empty());
    }
}
