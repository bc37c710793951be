//! Atomic file replacement
//!
//! Every durable write in the harness goes through this module: write to a
//! temporary file in the target directory, fsync, then rename over the
//! destination. Readers observe either the previous version or the new one,
//! never a partial file.

use camino::Utf8Path;
use std::fs;
use std::io::Write;

use tempfile::NamedTempFile;

use crate::error::StoreError;

/// Atomically replace `path` with `bytes`.
///
/// The temporary file is created in the same directory as the target so the
/// final rename stays on one filesystem. Parent directories are created as
/// needed.
pub fn write_bytes_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io("create directory", parent.as_str(), e))?;
    }

    let dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut tmp =
        NamedTempFile::new_in(dir).map_err(|e| StoreError::io("create temp file in", dir.as_str(), e))?;

    tmp.write_all(bytes)
        .map_err(|e| StoreError::io("write", path.as_str(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io("fsync", path.as_str(), e))?;

    tmp.persist(path.as_std_path())
        .map_err(|e| StoreError::io("rename into place", path.as_str(), e.error))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and atomically replace `path` with it.
pub fn write_json_atomic<T: serde::Serialize>(path: &Utf8Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| StoreError::Schema {
        path: path.to_string(),
        reason: format!("serialization failed: {e}"),
    })?;
    write_bytes_atomic(path, &json)
}
