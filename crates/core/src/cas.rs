//! Local content-addressable store
//!
//! Disk layout: `<root>/objects/sha256/<d0d1>/<d2d3>/<full-hex>`. Objects
//! become visible only after a digest check and an atomic rename, so readers
//! never observe partial or unverified content. Producers of the same digest
//! serialize on a per-digest advisory file lock, which the OS releases if
//! the process dies.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::atomic::fsync_dir;
use crate::digest::Digest;
use crate::error::{BundleError, Result};

/// How cached objects are materialized into the working tree
///
/// Hardlinks share the cache object's inode, and cache objects are
/// read-only; a hardlinked working file is therefore read-only too, and a
/// chmod on it would strip the cache's write protection. `Auto` skips
/// hardlinks for that reason; pick `Hardlink` explicitly if read-only
/// working copies are acceptable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// Reflink where the filesystem supports it, otherwise copy
    #[default]
    Auto,
    Reflink,
    Hardlink,
    Copy,
}

/// Disk-backed content-addressable store, shareable across projects and
/// processes
#[derive(Debug, Clone)]
pub struct LocalCas {
    root: PathBuf,
    objects: PathBuf,
}

impl LocalCas {
    /// Open (creating if needed) a store at `root`, or at the user cache
    /// directory when `None`.
    ///
    /// # Errors
    /// Returns `Config` if no cache directory can be determined, `Io` if it
    /// cannot be created.
    pub fn open(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(path) => path,
            None => dirs::cache_dir()
                .map(|d| d.join("modelops-bundle"))
                .ok_or_else(|| {
                    BundleError::Config("no user cache directory; set cache_dir".into())
                })?,
        };
        let objects = root.join("objects").join("sha256");
        fs::create_dir_all(&objects)?;
        Ok(Self { root, objects })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cache path for a digest. Safe to build from any `Digest`: the type
    /// guarantees the strict `sha256:<64 hex>` shape, so no path component
    /// here can traverse.
    #[must_use]
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.objects
            .join(digest.shard1())
            .join(digest.shard2())
            .join(digest.hex())
    }

    /// Existence check. No content verification; that happened at promotion.
    #[must_use]
    pub fn has(&self, digest: &Digest) -> bool {
        self.path_for(digest).is_file()
    }

    /// Ensure the object is cached, fetching it if necessary.
    ///
    /// `fetch` receives a temp-file path and is the only code that touches
    /// the network. Concurrent callers for the same digest serialize on the
    /// lock file; all but one observe the promoted object after the re-check
    /// and never invoke their callback.
    ///
    /// # Errors
    /// `DigestMismatch` if the fetched bytes hash wrong (the temp file is
    /// unlinked and nothing is promoted), plus whatever `fetch` itself
    /// returns.
    pub async fn ensure_present<F, Fut>(&self, digest: &Digest, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let dst = self.path_for(digest);
        reject_symlink(&dst)?;
        if dst.is_file() {
            return Ok(dst);
        }

        let parent = dst.parent().expect("object path always has a parent");
        fs::create_dir_all(parent)?;

        // The lock file persists after release; recreating it on every call
        // would race with holders on some platforms.
        let lock_path = parent.join(format!("{}.lock", digest.hex()));
        let lock = acquire_lock(lock_path).await?;

        let result = self.fetch_verify_promote(digest, &dst, fetch).await;

        if let Err(e) = FileExt::unlock(&lock) {
            warn!(digest = %digest.short(), "failed to release cas lock: {e}");
        }
        result?;
        Ok(dst)
    }

    async fn fetch_verify_promote<F, Fut>(&self, digest: &Digest, dst: &Path, fetch: F) -> Result<()>
    where
        F: FnOnce(PathBuf) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        // Somebody else may have promoted while we waited for the lock
        if dst.is_file() {
            debug!(digest = %digest.short(), "object appeared while waiting for lock");
            return Ok(());
        }

        let parent = dst.parent().expect("object path always has a parent");
        let temp_prefix = format!(".cas-{}-", digest.short());
        sweep_stale_temps(parent, &temp_prefix);

        // Temp file in the same directory keeps the final rename atomic
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(&temp_prefix)
            .tempfile_in(parent)?
            .keep()
            .map_err(|e| BundleError::Io(e.error))?;
        drop(file);

        let outcome = async {
            fetch(temp_path.clone()).await?;

            let expected = *digest;
            let temp = temp_path.clone();
            let dst = dst.to_path_buf();
            tokio::task::spawn_blocking(move || promote(&temp, &dst, &expected))
                .await
                .map_err(|e| BundleError::Io(std::io::Error::other(e)))?
        }
        .await;

        if outcome.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        outcome
    }

    /// Copy or link a cached object to `dest`.
    ///
    /// Every strategy stages into `<dest>.partial` and renames, so the
    /// destination either has the full content or does not exist. Partial
    /// files are removed on every exit path.
    ///
    /// # Errors
    /// `NotFound` if the object is not cached; `Io` if the requested
    /// strategy is unsupported on this filesystem (only `Auto` falls back).
    pub fn materialize(&self, digest: &Digest, dest: &Path, mode: LinkMode) -> Result<()> {
        let src = self.path_for(digest);
        if !src.is_file() {
            return Err(BundleError::NotFound(format!("object not in cache: {digest}")));
        }

        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;

        let name = dest
            .file_name()
            .ok_or_else(|| BundleError::InvalidInput(format!("bad destination: {}", dest.display())))?
            .to_string_lossy();
        let partial = dest.with_file_name(format!("{name}.partial"));
        let _ = fs::remove_file(&partial);

        let result = materialize_into(&src, dest, &partial, parent, mode);
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }
}

fn materialize_into(
    src: &Path,
    dest: &Path,
    partial: &Path,
    parent: &Path,
    mode: LinkMode,
) -> Result<()> {
    if matches!(mode, LinkMode::Reflink | LinkMode::Auto) {
        match reflink_copy::reflink(src, partial) {
            Ok(()) => {
                fsync_file(partial)?;
                fs::rename(partial, dest)?;
                fsync_dir(parent);
                debug!(dest = %dest.display(), "materialized via reflink");
                return Ok(());
            }
            Err(e) if mode == LinkMode::Reflink => {
                return Err(BundleError::Io(std::io::Error::other(format!(
                    "reflink not supported here: {e}"
                ))));
            }
            Err(_) => {
                let _ = fs::remove_file(partial);
            }
        }
    }

    if mode == LinkMode::Hardlink {
        fs::hard_link(src, partial)?;
        fs::rename(partial, dest)?;
        fsync_dir(parent);
        debug!(dest = %dest.display(), "materialized via hardlink");
        return Ok(());
    }

    fs::copy(src, partial)?;
    // The cache object is read-only; the working copy must not be
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(partial, fs::Permissions::from_mode(0o644))?;
    }
    fsync_file(partial)?;
    fs::rename(partial, dest)?;
    fsync_dir(parent);
    debug!(dest = %dest.display(), "materialized via copy");
    Ok(())
}

/// Verify, harden, and atomically publish a fetched temp file.
fn promote(temp: &Path, dst: &Path, expected: &Digest) -> Result<()> {
    let actual = Digest::of_file(temp)?;
    if actual != *expected {
        return Err(BundleError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    // Durable before visible: fsync while still writable, then drop write
    // permission so the published object cannot be corrupted in place.
    fsync_file(temp)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(temp, fs::Permissions::from_mode(0o444))?;
    }

    fs::rename(temp, dst)?;
    fsync_dir(dst.parent().expect("object path always has a parent"));
    debug!(dst = %dst.display(), "cas promoted");
    Ok(())
}

async fn acquire_lock(lock_path: PathBuf) -> Result<File> {
    tokio::task::spawn_blocking(move || -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(file)
    })
    .await
    .map_err(|e| BundleError::Io(std::io::Error::other(e)))?
}

/// Remove temp files a crashed producer of this digest left behind. Called
/// under the digest lock, so nothing live can own them.
fn sweep_stale_temps(dir: &Path, prefix: &str) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(prefix) {
            warn!(file = %entry.path().display(), "removing stale cas temp file");
            let _ = fs::remove_file(entry.path());
        }
    }
}

fn reject_symlink(path: &Path) -> Result<()> {
    if let Ok(meta) = path.symlink_metadata() {
        if meta.file_type().is_symlink() {
            return Err(BundleError::InvalidInput(format!(
                "symlink in cache rejected: {}",
                path.display()
            )));
        }
    }
    Ok(())
}

fn fsync_file(path: &Path) -> Result<()> {
    OpenOptions::new().write(true).open(path)?.sync_all()?;
    Ok(())
}
