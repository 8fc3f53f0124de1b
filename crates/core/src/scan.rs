//! Workspace inventory: what exists on disk
//!
//! Walks the project tree applying ignore rules and returns cheap metadata
//! (size, mtime) per file. No file contents are read here; hashing happens
//! in the snapshot layer for tracked files only.

use std::path::Path;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::error::Result;
use crate::ignore::IgnoreMatcher;
use crate::path::BundlePath;

/// Metadata for one file found during a scan
#[derive(Debug, Clone)]
pub struct WorkingEntry {
    /// Project-relative path
    pub path: BundlePath,
    /// File size in bytes
    pub size: u64,
    /// Modification time
    pub mtime: SystemTime,
}

/// Scan the project tree for candidate files.
///
/// Entries are returned in lexicographic path order. Files that vanish
/// between directory listing and stat are skipped with a warning; symlinks
/// are never followed.
///
/// # Errors
/// Returns `Io` if a directory cannot be listed.
pub fn scan_workspace(root: &Path, matcher: &IgnoreMatcher) -> Result<Vec<WorkingEntry>> {
    let mut entries = Vec::new();
    walk_dir(root, root, matcher, &mut entries)?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    matcher: &IgnoreMatcher,
    out: &mut Vec<WorkingEntry>,
) -> Result<()> {
    let mut children: Vec<_> = match std::fs::read_dir(dir) {
        Ok(iter) => iter.collect::<std::io::Result<_>>()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Directory removed mid-scan
            warn!(dir = %dir.display(), "directory vanished during scan");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    children.sort_by_key(std::fs::DirEntry::file_name);

    for child in children {
        let path = child.path();
        let file_type = match child.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                warn!(path = %path.display(), "entry vanished during scan: {e}");
                continue;
            }
        };

        if file_type.is_symlink() {
            // Symlinks are not bundle content; following them could escape
            // the project root.
            debug!(path = %path.display(), "skipping symlink");
            continue;
        }

        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let Ok(bundle_path) = BundlePath::from_relative(rel) else {
            debug!(path = %path.display(), "skipping non-portable path");
            continue;
        };

        if file_type.is_dir() {
            if matcher.should_traverse(bundle_path.as_str()) {
                walk_dir(root, &path, matcher, out)?;
            }
            continue;
        }

        if matcher.is_ignored(&bundle_path) {
            continue;
        }

        let meta = match path.metadata() {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "file vanished during scan");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        out.push(WorkingEntry {
            path: bundle_path,
            size: meta.len(),
            mtime: meta.modified()?,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scan(dir: &TempDir) -> Vec<String> {
        let matcher = IgnoreMatcher::new(dir.path(), &[]).unwrap();
        scan_workspace(dir.path(), &matcher)
            .unwrap()
            .into_iter()
            .map(|e| e.path.as_str().to_string())
            .collect()
    }

    #[test]
    fn test_scan_finds_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src/sub")).unwrap();
        std::fs::write(dir.path().join("root.txt"), "r").unwrap();
        std::fs::write(dir.path().join("src/model.py"), "m").unwrap();
        std::fs::write(dir.path().join("src/sub/deep.py"), "d").unwrap();

        let paths = scan(&dir);
        assert_eq!(paths, vec!["root.txt", "src/model.py", "src/sub/deep.py"]);
    }

    #[test]
    fn test_scan_order_is_lexicographic() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        std::fs::write(dir.path().join("a/b.txt"), "x").unwrap();
        std::fs::write(dir.path().join("b.txt"), "x").unwrap();

        // '.' sorts before '/', so "a.txt" < "a/b.txt"
        assert_eq!(scan(&dir), vec!["a.txt", "a/b.txt", "b.txt"]);
    }

    #[test]
    fn test_scan_applies_ignore_rules() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join(".modelops-bundle")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "x").unwrap();
        std::fs::write(dir.path().join(".modelops-bundle/state.json"), "{}").unwrap();
        std::fs::write(dir.path().join(".DS_Store"), "x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        assert_eq!(scan(&dir), vec!["keep.txt"]);
    }

    #[test]
    fn test_scan_reports_size_and_mtime() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("x.bin"), vec![0u8; 1024]).unwrap();

        let matcher = IgnoreMatcher::new(dir.path(), &[]).unwrap();
        let entries = scan_workspace(dir.path(), &matcher).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 1024);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_symlinks() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("real.txt"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        assert_eq!(scan(&dir), vec!["real.txt"]);
    }
}
