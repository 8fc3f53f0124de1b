//! Tracked snapshot: digests of every tracked file
//!
//! This is the expensive step: every tracked file present on disk is hashed.
//! Hashing runs on the rayon pool, so wall time is bounded by the slowest
//! spindle rather than file count. Tracked paths missing from disk are
//! reported separately; they feed deletion detection in the diff.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use rayon::prelude::*;

use crate::digest::Digest;
use crate::error::{BundleError, Result};
use crate::path::BundlePath;
use crate::tracked::TrackedSet;

/// A tracked file as it exists on disk right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: BundlePath,
    pub digest: Digest,
    pub size: u64,
}

/// Point-in-time view of the tracked set
#[derive(Debug, Clone, Default)]
pub struct TrackedSnapshot {
    /// Files present on disk, keyed by path
    pub files: BTreeMap<BundlePath, FileInfo>,
    /// Tracked paths with no file behind them (locally deleted)
    pub missing: BTreeSet<BundlePath>,
}

impl TrackedSnapshot {
    /// Hash every tracked file under `root`.
    ///
    /// # Errors
    /// Fails fast with `Io` if any tracked file exists but cannot be read;
    /// "not present" is not an error and lands in `missing`.
    pub fn scan(tracked: &TrackedSet, root: &Path) -> Result<Self> {
        let results: Vec<(BundlePath, Option<FileInfo>)> = tracked
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|path| {
                let native = path.to_native(root);
                match std::fs::metadata(&native) {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok((path, None)),
                    Err(e) => Err(BundleError::from(e)),
                    Ok(meta) => {
                        let digest = Digest::of_file(&native)?;
                        let info = FileInfo {
                            path: path.clone(),
                            digest,
                            size: meta.len(),
                        };
                        Ok((path, Some(info)))
                    }
                }
            })
            .collect::<Result<_>>()?;

        let mut snapshot = Self::default();
        for (path, info) in results {
            match info {
                Some(info) => {
                    snapshot.files.insert(path, info);
                }
                None => {
                    snapshot.missing.insert(path);
                }
            }
        }
        Ok(snapshot)
    }

    /// Path → digest view, the shape the diff engine consumes.
    #[must_use]
    pub fn digests(&self) -> BTreeMap<BundlePath, Digest> {
        self.files
            .iter()
            .map(|(p, info)| (p.clone(), info.digest))
            .collect()
    }

    /// Total bytes of files present on disk.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.missing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore::IgnoreMatcher;
    use tempfile::TempDir;

    fn track(dir: &TempDir, paths: &[&str]) -> TrackedSet {
        let m = IgnoreMatcher::new(dir.path(), &[]).unwrap();
        let mut set = TrackedSet::new();
        for p in paths {
            set.add(BundlePath::parse(*p).unwrap(), &m, false).unwrap();
        }
        set
    }

    #[test]
    fn test_scan_hashes_tracked_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/model.py"), b"print('hi')").unwrap();
        std::fs::write(dir.path().join("untracked.txt"), b"nope").unwrap();

        let tracked = track(&dir, &["src/model.py"]);
        let snap = TrackedSnapshot::scan(&tracked, dir.path()).unwrap();

        assert_eq!(snap.files.len(), 1);
        let info = &snap.files[&BundlePath::parse("src/model.py").unwrap()];
        assert_eq!(info.digest, Digest::of_bytes(b"print('hi')"));
        assert_eq!(info.size, 11);
        assert!(snap.missing.is_empty());
    }

    #[test]
    fn test_scan_reports_missing_separately() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("present.txt"), b"x").unwrap();

        let tracked = track(&dir, &["present.txt", "gone.txt"]);
        let snap = TrackedSnapshot::scan(&tracked, dir.path()).unwrap();

        assert_eq!(snap.files.len(), 1);
        assert!(snap
            .missing
            .contains(&BundlePath::parse("gone.txt").unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_fails_fast_on_unreadable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("locked.bin");
        std::fs::write(&path, b"secret").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o000)).unwrap();

        let tracked = track(&dir, &["locked.bin"]);
        let result = TrackedSnapshot::scan(&tracked, dir.path());

        // Root can read anything, so only assert when the open actually fails
        if let Err(e) = result {
            assert_eq!(e.exit_code(), 1);
        }

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    #[test]
    fn test_digests_view() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

        let tracked = track(&dir, &["a.txt"]);
        let snap = TrackedSnapshot::scan(&tracked, dir.path()).unwrap();
        let digests = snap.digests();
        assert_eq!(
            digests[&BundlePath::parse("a.txt").unwrap()],
            Digest::of_bytes(b"a")
        );
    }
}
