//! Sync state: what the server looked like when we last spoke to it
//!
//! Stored at `.modelops-bundle/state.json` and updated atomically at the end
//! of every successful push or pull. `last_synced_files` is the base of the
//! three-way diff; a crash before the update leaves it pointing at the
//! previous version, which keeps re-runs idempotent.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::digest::Digest;
use crate::error::{BundleError, Result};
use crate::path::BundlePath;

/// Persistent record of the last successful push and pull
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    /// Manifest digest of our last successful push, if any
    #[serde(default)]
    pub last_push_digest: Option<Digest>,
    /// Manifest digest of our last successful pull, if any
    #[serde(default)]
    pub last_pull_digest: Option<Digest>,
    /// Server-side file set at last sync; base for the three-way diff
    #[serde(default)]
    pub last_synced_files: BTreeMap<BundlePath, Digest>,
    /// When the state was last written
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Load from `state.json`, or return the empty state if absent.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the file exists but does not parse.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| BundleError::InvalidInput(format!("corrupt sync state: {e}")))
    }

    /// Persist via atomic replace.
    ///
    /// # Errors
    /// Returns `Io` on write failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| BundleError::InvalidInput(format!("cannot serialize sync state: {e}")))?;
        write_atomic(path, &bytes)
    }

    /// Record a successful push. The synced file set becomes exactly the
    /// pushed index, pruning anything deleted locally.
    pub fn record_push(&mut self, manifest_digest: Digest, files: BTreeMap<BundlePath, Digest>) {
        self.last_push_digest = Some(manifest_digest);
        self.last_synced_files = files;
        self.updated_at = Some(Utc::now());
    }

    /// Record a successful pull. Mirror semantics: the synced file set
    /// becomes exactly the remote index.
    pub fn record_pull(&mut self, manifest_digest: Digest, files: BTreeMap<BundlePath, Digest>) {
        self.last_pull_digest = Some(manifest_digest);
        self.last_synced_files = files;
        self.updated_at = Some(Utc::now());
    }

    /// Whether the tag's current digest is one we synced with, so a push is
    /// a fast-forward. A client that only ever pulled qualifies through its
    /// pull digest; an existing tag we never synced with does not.
    #[must_use]
    pub fn matches_remote(&self, current: Option<&Digest>) -> bool {
        if current == self.last_push_digest.as_ref() {
            return true;
        }
        current.is_some() && current == self.last_pull_digest.as_ref()
    }

    /// The digest we believe the tag points at, for error messages.
    #[must_use]
    pub fn expected_remote(&self) -> Option<&Digest> {
        self.last_push_digest
            .as_ref()
            .or(self.last_pull_digest.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(n: u8) -> Digest {
        Digest::of_bytes(&[n])
    }

    fn p(s: &str) -> BundlePath {
        BundlePath::parse(s).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut state = SyncState::default();
        state.record_push(digest(1), BTreeMap::from([(p("a.txt"), digest(2))]));
        state.save(&path).unwrap();

        let loaded = SyncState::load(&path).unwrap();
        assert_eq!(loaded.last_push_digest, Some(digest(1)));
        assert_eq!(loaded.last_synced_files[&p("a.txt")], digest(2));
        assert!(loaded.updated_at.is_some());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let state = SyncState::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(state, SyncState::default());
    }

    #[test]
    fn test_record_push_prunes_deleted_files() {
        let mut state = SyncState::default();
        state.record_push(
            digest(1),
            BTreeMap::from([(p("old.txt"), digest(2)), (p("keep.txt"), digest(3))]),
        );
        state.record_push(digest(4), BTreeMap::from([(p("keep.txt"), digest(3))]));

        assert!(!state.last_synced_files.contains_key(&p("old.txt")));
        assert_eq!(state.last_push_digest, Some(digest(4)));
    }

    #[test]
    fn test_matches_remote() {
        let mut state = SyncState::default();
        // Fresh client, fresh tag
        assert!(state.matches_remote(None));
        // Fresh client, somebody else's tag
        assert!(!state.matches_remote(Some(&digest(1))));

        // Pull-only client may fast-forward the tag it pulled
        state.record_pull(digest(1), BTreeMap::new());
        assert!(state.matches_remote(Some(&digest(1))));
        assert!(!state.matches_remote(Some(&digest(2))));

        // After a push, the pushed digest is the base
        state.record_push(digest(3), BTreeMap::new());
        assert!(state.matches_remote(Some(&digest(3))));
        assert_eq!(state.expected_remote(), Some(&digest(3)));
    }

    #[test]
    fn test_corrupt_state_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = SyncState::load(&path).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
