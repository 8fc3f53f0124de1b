//! Atomic file replacement
//!
//! Tracked list, sync state, and config writes all go through here: write to
//! a temp file in the target directory, fsync, rename over the target, then
//! fsync the directory so the rename itself is durable.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::error::Result;

/// Atomically replace `path` with `data`.
///
/// # Errors
/// Returns `Io` if the temp file cannot be written or the rename fails. The
/// temp file is removed on any failure path.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}.tmp-"))
        .tempfile_in(parent)?;

    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;

    // NamedTempFile::persist is an atomic rename; it unlinks the temp file
    // for us if the rename fails.
    tmp.persist(path).map_err(|e| e.error)?;

    fsync_dir(parent);
    Ok(())
}

/// Fsync a directory so a rename within it survives a crash.
///
/// Best effort: not every platform or filesystem supports directory fsync,
/// and the file contents are already durable at this point.
pub fn fsync_dir(dir: &Path) {
    match File::open(dir) {
        Ok(f) => {
            if let Err(e) = f.sync_all() {
                debug!(dir = %dir.display(), "directory fsync not supported: {e}");
            }
        }
        Err(e) => debug!(dir = %dir.display(), "cannot open directory for fsync: {e}"),
    }
}
