//! Bundle sync status: the user-facing state machine
//!
//! Folds a three-way diff into one of the observable states (clean, local
//! changes, behind, ahead, diverged, unknown) plus per-state counts for
//! display. Status never mutates anything and works offline: with no
//! reachable remote the answer is `Unknown` with a local-only summary.

use std::collections::BTreeSet;

use crate::diff::{DiffResult, FileState, RemoteState};
use crate::path::BundlePath;
use crate::scan::WorkingEntry;
use crate::state::SyncState;
use crate::tracked::TrackedSet;

/// Observable sync states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStatus {
    /// Local, remote, and last sync all agree
    Clean,
    /// Local edits on top of an unmoved remote
    LocalChanges,
    /// Remote moved; local matches the last sync
    Behind,
    /// Local edits and we were the last pusher: a push fast-forwards the tag
    Ahead,
    /// Both sides moved since the last sync
    Diverged,
    /// Registry unreachable; only local facts available
    Unknown,
}

/// Counts and listings backing the status display
#[derive(Debug, Clone, Default)]
pub struct StatusSummary {
    pub status: Option<BundleStatus>,
    pub total_tracked: usize,
    pub total_size: u64,

    pub unchanged: usize,
    pub added_local: usize,
    pub added_remote: usize,
    pub modified_local: usize,
    pub modified_remote: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub conflicts: usize,

    /// Files on disk that pass the ignore rules but are not tracked
    pub untracked: Vec<BundlePath>,
}

impl StatusSummary {
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.added_local > 0 || self.modified_local > 0 || self.deleted_local > 0
    }
}

/// Fold a diff into the observable status.
///
/// `remote` carries `None` as manifest digest when the tag does not exist,
/// which behaves like an empty remote, not like `Unknown`; pass
/// `remote = None` itself for "registry unreachable".
#[must_use]
pub fn bundle_status(
    diff: &DiffResult,
    remote: Option<&RemoteState>,
    state: &SyncState,
) -> BundleStatus {
    let Some(remote) = remote else {
        return BundleStatus::Unknown;
    };

    let local = diff.has_local_changes();
    let remote_moved = diff.has_remote_changes();

    if diff.has_conflicts() || (local && remote_moved) {
        BundleStatus::Diverged
    } else if remote_moved {
        BundleStatus::Behind
    } else if local {
        // Ahead means the remote still points where our last push left it,
        // so pushing is a fast-forward; otherwise plain local changes.
        if remote.manifest_digest.is_some() && remote.manifest_digest == state.last_push_digest {
            BundleStatus::Ahead
        } else {
            BundleStatus::LocalChanges
        }
    } else {
        BundleStatus::Clean
    }
}

/// Build the full status summary for display.
#[must_use]
pub fn status_summary(
    diff: &DiffResult,
    remote: Option<&RemoteState>,
    state: &SyncState,
    tracked: &TrackedSet,
    inventory: &[WorkingEntry],
) -> StatusSummary {
    let mut summary = StatusSummary {
        status: Some(bundle_status(diff, remote, state)),
        total_tracked: tracked.len(),
        ..StatusSummary::default()
    };

    for change in &diff.changes {
        match change.state {
            FileState::Unchanged => summary.unchanged += 1,
            FileState::AddedLocal => summary.added_local += 1,
            FileState::AddedRemote => summary.added_remote += 1,
            FileState::ModifiedLocal => summary.modified_local += 1,
            FileState::ModifiedRemote => summary.modified_remote += 1,
            FileState::DeletedLocal => summary.deleted_local += 1,
            FileState::DeletedRemote => summary.deleted_remote += 1,
            FileState::Conflict => summary.conflicts += 1,
            FileState::Untracked => {}
        }
        if let Some(local) = &change.local {
            summary.total_size += local.size;
        }
    }

    let tracked_paths: BTreeSet<&BundlePath> = tracked.iter().collect();
    summary.untracked = inventory
        .iter()
        .filter(|e| !tracked_paths.contains(&e.path))
        .map(|e| e.path.clone())
        .collect();

    summary
}
