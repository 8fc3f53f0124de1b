//! Three-way diff between working tree, last sync, and remote
//!
//! Classifies every path across local snapshot (L), remote index (R), and
//! the last-synced base (S). Digest equality is the only comparison; mtimes
//! never decide anything. With no base entry, a both-sides addition with
//! different content is a conflict, never a silent winner.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::digest::Digest;
use crate::index::BundleIndex;
use crate::path::BundlePath;
use crate::snapshot::{FileInfo, TrackedSnapshot};
use crate::state::SyncState;

/// Lifecycle classification of one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Unchanged,
    AddedLocal,
    AddedRemote,
    ModifiedLocal,
    ModifiedRemote,
    DeletedLocal,
    DeletedRemote,
    Conflict,
    /// Present on disk but not tracked; produced by status, not by the
    /// three-way classification itself
    Untracked,
}

/// A remote file as seen through the bundle index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFile {
    pub digest: Digest,
    pub size: u64,
}

/// Remote side of a diff: resolved manifest digest plus file set
#[derive(Debug, Clone, Default)]
pub struct RemoteState {
    /// Digest the reference resolved to; `None` when the tag does not exist
    pub manifest_digest: Option<Digest>,
    pub files: BTreeMap<BundlePath, RemoteFile>,
}

impl RemoteState {
    /// Remote state for an absent tag.
    #[must_use]
    pub fn absent() -> Self {
        Self::default()
    }

    /// View of a fetched bundle index.
    #[must_use]
    pub fn from_index(manifest_digest: Digest, index: &BundleIndex) -> Self {
        let files = index
            .files
            .iter()
            .map(|(p, e)| {
                (
                    p.clone(),
                    RemoteFile {
                        digest: e.digest,
                        size: e.size,
                    },
                )
            })
            .collect();
        Self {
            manifest_digest: Some(manifest_digest),
            files,
        }
    }
}

/// One classified path with the digests that drove the decision
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: BundlePath,
    pub state: FileState,
    pub local: Option<FileInfo>,
    pub remote: Option<RemoteFile>,
    pub last_synced: Option<Digest>,
}

/// Full classification of `L ∪ R ∪ S`
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub changes: Vec<FileChange>,
}

impl DiffResult {
    /// Paths in a given state, in path order.
    #[must_use]
    pub fn paths_in(&self, state: FileState) -> Vec<&BundlePath> {
        self.changes
            .iter()
            .filter(|c| c.state == state)
            .map(|c| &c.path)
            .collect()
    }

    /// Count per state.
    #[must_use]
    pub fn count(&self, state: FileState) -> usize {
        self.changes.iter().filter(|c| c.state == state).count()
    }

    /// Any local-side change (what a push would publish).
    #[must_use]
    pub fn has_local_changes(&self) -> bool {
        self.changes.iter().any(|c| {
            matches!(
                c.state,
                FileState::AddedLocal | FileState::ModifiedLocal | FileState::DeletedLocal
            )
        })
    }

    /// Any remote-side change (what a pull would bring in).
    #[must_use]
    pub fn has_remote_changes(&self) -> bool {
        self.changes.iter().any(|c| {
            matches!(
                c.state,
                FileState::AddedRemote | FileState::ModifiedRemote | FileState::DeletedRemote
            )
        })
    }

    /// Any path where both sides diverged.
    #[must_use]
    pub fn has_conflicts(&self) -> bool {
        self.changes.iter().any(|c| c.state == FileState::Conflict)
    }
}

/// Classify every path across local, remote, and base.
#[must_use]
pub fn compute_diff(
    local: &TrackedSnapshot,
    remote: &RemoteState,
    state: &SyncState,
) -> DiffResult {
    let base = &state.last_synced_files;
    let mut changes = Vec::new();

    // Locally deleted tracked paths first: the snapshot only holds files
    // that exist, so deletions come from the missing set.
    for path in &local.missing {
        let last = base.get(path).copied();
        let remote_file = remote.files.get(path).copied();

        let Some(last_digest) = last else {
            // Added then deleted before ever syncing; nothing to report
            continue;
        };

        let change_state = match remote_file {
            Some(r) if r.digest != last_digest => FileState::Conflict,
            _ => FileState::DeletedLocal,
        };
        changes.push(FileChange {
            path: path.clone(),
            state: change_state,
            local: None,
            remote: remote_file,
            last_synced: Some(last_digest),
        });
    }

    let mut all_paths: BTreeSet<&BundlePath> = local.files.keys().collect();
    all_paths.extend(remote.files.keys());
    all_paths.extend(base.keys());

    for path in all_paths {
        if local.missing.contains(path) {
            continue; // handled above
        }

        let local_file = local.files.get(path);
        let remote_file = remote.files.get(path).copied();
        let last = base.get(path).copied();

        let change_state = match (local_file, remote_file) {
            (Some(l), Some(r)) => {
                if l.digest == r.digest {
                    FileState::Unchanged
                } else {
                    match last {
                        None => FileState::Conflict,
                        Some(s) if l.digest == s && r.digest != s => FileState::ModifiedRemote,
                        Some(s) if r.digest == s && l.digest != s => FileState::ModifiedLocal,
                        Some(_) => FileState::Conflict,
                    }
                }
            }
            (Some(l), None) => match last {
                None => FileState::AddedLocal,
                Some(s) if l.digest == s => FileState::DeletedRemote,
                Some(_) => FileState::Conflict,
            },
            (None, Some(r)) => match last {
                None => FileState::AddedRemote,
                Some(s) if r.digest == s => FileState::DeletedLocal,
                Some(_) => FileState::Conflict,
            },
            // In the base only: deleted on both sides, nothing left to do
            (None, None) => FileState::Unchanged,
        };

        changes.push(FileChange {
            path: path.clone(),
            state: change_state,
            local: local_file.cloned(),
            remote: remote_file,
            last_synced: last,
        });
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    DiffResult { changes }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> BundlePath {
        BundlePath::parse(s).unwrap()
    }

    fn d(n: u8) -> Digest {
        Digest::of_bytes(&[n])
    }

    fn local_with(files: &[(&str, u8)], missing: &[&str]) -> TrackedSnapshot {
        let mut snap = TrackedSnapshot::default();
        for (path, n) in files {
            snap.files.insert(
                p(path),
                FileInfo {
                    path: p(path),
                    digest: d(*n),
                    size: 1,
                },
            );
        }
        for path in missing {
            snap.missing.insert(p(path));
        }
        snap
    }

    fn remote_with(files: &[(&str, u8)]) -> RemoteState {
        RemoteState {
            manifest_digest: Some(d(99)),
            files: files
                .iter()
                .map(|(path, n)| (p(path), RemoteFile { digest: d(*n), size: 1 }))
                .collect(),
        }
    }

    fn base_with(files: &[(&str, u8)]) -> SyncState {
        SyncState {
            last_synced_files: files.iter().map(|(path, n)| (p(path), d(*n))).collect(),
            ..SyncState::default()
        }
    }

    fn classify(local: &TrackedSnapshot, remote: &RemoteState, base: &SyncState) -> FileState {
        let diff = compute_diff(local, remote, base);
        assert_eq!(diff.changes.len(), 1, "{:?}", diff.changes);
        diff.changes[0].state
    }

    #[test]
    fn test_all_three_equal_is_unchanged() {
        let state = classify(
            &local_with(&[("f", 1)], &[]),
            &remote_with(&[("f", 1)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::Unchanged);
    }

    #[test]
    fn test_local_edit_is_modified_local() {
        let state = classify(
            &local_with(&[("f", 2)], &[]),
            &remote_with(&[("f", 1)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::ModifiedLocal);
    }

    #[test]
    fn test_remote_edit_is_modified_remote() {
        let state = classify(
            &local_with(&[("f", 1)], &[]),
            &remote_with(&[("f", 2)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::ModifiedRemote);
    }

    #[test]
    fn test_both_edited_is_conflict() {
        let state = classify(
            &local_with(&[("f", 2)], &[]),
            &remote_with(&[("f", 3)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::Conflict);
    }

    #[test]
    fn test_added_both_same_content_is_unchanged() {
        let state = classify(
            &local_with(&[("f", 1)], &[]),
            &remote_with(&[("f", 1)]),
            &SyncState::default(),
        );
        assert_eq!(state, FileState::Unchanged);
    }

    #[test]
    fn test_added_both_different_content_is_conflict() {
        let state = classify(
            &local_with(&[("f", 1)], &[]),
            &remote_with(&[("f", 2)]),
            &SyncState::default(),
        );
        assert_eq!(state, FileState::Conflict);
    }

    #[test]
    fn test_remote_deleted_unmodified_local() {
        let state = classify(
            &local_with(&[("f", 1)], &[]),
            &RemoteState::absent(),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::DeletedRemote);
    }

    #[test]
    fn test_remote_deleted_modified_local_is_conflict() {
        let state = classify(
            &local_with(&[("f", 2)], &[]),
            &RemoteState::absent(),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::Conflict);
    }

    #[test]
    fn test_new_local_file_is_added_local() {
        let state = classify(
            &local_with(&[("f", 1)], &[]),
            &RemoteState::absent(),
            &SyncState::default(),
        );
        assert_eq!(state, FileState::AddedLocal);
    }

    #[test]
    fn test_locally_deleted_unchanged_remote() {
        let state = classify(
            &local_with(&[], &["f"]),
            &remote_with(&[("f", 1)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::DeletedLocal);
    }

    #[test]
    fn test_locally_deleted_remote_modified_is_conflict() {
        let state = classify(
            &local_with(&[], &["f"]),
            &remote_with(&[("f", 2)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::Conflict);
    }

    #[test]
    fn test_locally_deleted_never_synced_is_silent() {
        let diff = compute_diff(
            &local_with(&[], &["f"]),
            &RemoteState::absent(),
            &SyncState::default(),
        );
        assert!(diff.changes.is_empty());
    }

    #[test]
    fn test_new_remote_file_is_added_remote() {
        let state = classify(
            &TrackedSnapshot::default(),
            &remote_with(&[("f", 1)]),
            &SyncState::default(),
        );
        assert_eq!(state, FileState::AddedRemote);
    }

    #[test]
    fn test_untracked_synced_remote_unchanged_is_deleted_local() {
        // Path dropped from tracking entirely: not in snapshot, not missing
        let state = classify(
            &TrackedSnapshot::default(),
            &remote_with(&[("f", 1)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::DeletedLocal);
    }

    #[test]
    fn test_untracked_synced_remote_changed_is_conflict() {
        let state = classify(
            &TrackedSnapshot::default(),
            &remote_with(&[("f", 2)]),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::Conflict);
    }

    #[test]
    fn test_deleted_both_sides_is_unchanged() {
        let state = classify(
            &TrackedSnapshot::default(),
            &RemoteState::absent(),
            &base_with(&[("f", 1)]),
        );
        assert_eq!(state, FileState::Unchanged);
    }

    #[test]
    fn test_rename_appears_as_delete_plus_add() {
        // Same content at a new path: old path deleted, new path added,
        // digests equal so storage can reuse the blob
        let diff = compute_diff(
            &local_with(&[("new.bin", 1)], &["old.bin"]),
            &remote_with(&[("old.bin", 1)]),
            &base_with(&[("old.bin", 1)]),
        );

        let by_path: BTreeMap<_, _> = diff
            .changes
            .iter()
            .map(|c| (c.path.as_str(), c.state))
            .collect();
        assert_eq!(by_path["old.bin"], FileState::DeletedLocal);
        assert_eq!(by_path["new.bin"], FileState::AddedLocal);
    }

    #[test]
    fn test_summary_helpers() {
        let diff = compute_diff(
            &local_with(&[("a", 1), ("b", 2)], &[]),
            &remote_with(&[("a", 1), ("c", 3)]),
            &base_with(&[("a", 1)]),
        );
        assert!(diff.has_local_changes());
        assert!(diff.has_remote_changes());
        assert!(!diff.has_conflicts());
        assert_eq!(diff.count(FileState::Unchanged), 1);
        assert_eq!(diff.paths_in(FileState::AddedLocal), vec![&p("b")]);
    }
}
