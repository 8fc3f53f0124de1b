//! The tracked set: which files belong to the bundle
//!
//! Persisted as a sorted text file, one POSIX path per line. Adding a path
//! that matches the ignore rules requires `force`; force-added paths are the
//! one sanctioned way to override the built-in excludes.

use std::collections::BTreeSet;
use std::path::Path;

use crate::atomic::write_atomic;
use crate::error::{BundleError, Result};
use crate::ignore::IgnoreMatcher;
use crate::path::BundlePath;

/// Ordered, de-duplicated set of tracked paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedSet {
    paths: BTreeSet<BundlePath>,
}

impl TrackedSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from the tracked file, or return an empty set if absent.
    ///
    /// # Errors
    /// Returns `Io` if the file exists but cannot be read, or `InvalidInput`
    /// if it contains a malformed path.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let text = std::fs::read_to_string(path)?;
        let mut paths = BTreeSet::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            paths.insert(BundlePath::parse(line)?);
        }
        Ok(Self { paths })
    }

    /// Persist as a sorted text file via atomic replace.
    ///
    /// # Errors
    /// Returns `Io` on write failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut text = String::new();
        for p in &self.paths {
            text.push_str(p.as_str());
            text.push('\n');
        }
        write_atomic(path, text.as_bytes())
    }

    /// Track a path. Returns `false` if it was already tracked.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the path matches the ignore rules and
    /// `force` is not set.
    pub fn add(&mut self, path: BundlePath, matcher: &IgnoreMatcher, force: bool) -> Result<bool> {
        if !force && matcher.is_ignored(&path) {
            return Err(BundleError::InvalidInput(format!(
                "{path} matches ignore rules; use force to track it anyway"
            )));
        }
        Ok(self.paths.insert(path))
    }

    /// Stop tracking a path. Returns `false` if it was not tracked.
    pub fn remove(&mut self, path: &BundlePath) -> bool {
        self.paths.remove(path)
    }

    /// Replace the whole set (used by pull, which mirrors the remote).
    pub fn replace_with(&mut self, paths: impl IntoIterator<Item = BundlePath>) {
        self.paths = paths.into_iter().collect();
    }

    #[must_use]
    pub fn contains(&self, path: &BundlePath) -> bool {
        self.paths.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BundlePath> {
        self.paths.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
