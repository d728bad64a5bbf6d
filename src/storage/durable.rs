//! Crash-safe file primitives.
//!
//! Once [`atomic_replace`] or [`append_line`] returns `Ok`, the bytes survive a
//! process crash. Directory fsync is best effort because some filesystems do
//! not support it; every other failure propagates.

use super::{Result, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Fsyncs a directory so renames and new entries inside it are durable.
///
/// Failures are logged and swallowed.
pub fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        debug!(path = %dir.display(), error = %e, "directory fsync unavailable");
    }
}

/// Creates `dir` and its parents.
///
/// # Errors
/// Returns an error if the directory cannot be created.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| StorageError::io("create_dir", dir, e))
}

/// Replaces `path` with `bytes` atomically.
///
/// Writes a temp file next to the target, fsyncs it, renames it over the
/// target and fsyncs the directory. The temp file never outlives a failure.
///
/// # Errors
/// Returns [`StorageError::MissingParent`] if the target directory does not
/// exist, or the I/O error from any step.
pub fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    if !parent.is_dir() {
        return Err(StorageError::MissingParent {
            path: path.to_path_buf(),
        });
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(&parent)
        .map_err(|e| StorageError::io("create_temp", &parent, e))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.flush())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| StorageError::io("write_temp", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StorageError::io("rename", path, e.error))?;

    sync_dir(&parent);
    Ok(())
}

/// Appends one record to a log file.
///
/// The caller must hold the lock that owns `path`. The record is written
/// together with its newline terminator, then the file and its directory are
/// fsynced.
///
/// # Errors
/// - [`StorageError::InvalidLine`] if `line` contains a line break.
/// - [`StorageError::IncompleteTail`] if the file does not end with a newline,
///   which means an earlier append was cut short.
/// - [`StorageError::MissingParent`] or I/O errors otherwise.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if line.contains(['\n', '\r']) {
        return Err(StorageError::InvalidLine {
            reason: "record contains a line break".to_string(),
        });
    }
    let parent = parent_dir(path);
    if !parent.is_dir() {
        return Err(StorageError::MissingParent {
            path: path.to_path_buf(),
        });
    }

    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| StorageError::io("open_append", path, e))?;

    if !ends_with_newline(&mut file).map_err(|e| StorageError::io("read_tail", path, e))? {
        return Err(StorageError::IncompleteTail {
            path: path.to_path_buf(),
        });
    }

    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');
    file.write_all(record.as_bytes())
        .and_then(|()| file.flush())
        .and_then(|()| file.sync_all())
        .map_err(|e| StorageError::io("append", path, e))?;

    sync_dir(&parent);
    Ok(())
}

/// Empty files count as newline-terminated.
fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Reads a file, returning `None` if it does not exist.
///
/// # Errors
/// Returns any I/O error other than not-found.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io("read", path, e)),
    }
}

/// Moves a file and fsyncs both directories.
///
/// # Errors
/// Returns the rename error, or [`StorageError::MissingParent`] when the
/// destination directory is missing.
pub fn rename_durable(from: &Path, to: &Path) -> Result<()> {
    let to_parent = parent_dir(to);
    if !to_parent.is_dir() {
        return Err(StorageError::MissingParent {
            path: to.to_path_buf(),
        });
    }
    fs::rename(from, to).map_err(|e| StorageError::io("rename", from, e))?;
    sync_dir(&parent_dir(from));
    sync_dir(&to_parent);
    Ok(())
}
