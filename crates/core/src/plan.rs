//! Plan building: the "decide" half of plan/apply
//!
//! A plan captures everything apply needs, resolved to immutable digests:
//! the tag's digest at plan time, the upload or fetch lists, and (for push)
//! the exact index and manifest bytes that will be written. Tags may move
//! between plan and apply; apply re-checks and fails with `TagMoved` rather
//! than publishing over somebody else's push.

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use crate::diff::{compute_diff, FileState, RemoteState};
use crate::digest::Digest;
use crate::error::{BundleError, Result};
use crate::index::{BlobRef, BundleIndex, FileEntry};
use crate::manifest::OciManifest;
use crate::path::BundlePath;
use crate::policy::{StorageKind, StoragePolicy};
use crate::remote::{fetch_blob_bytes, BlobStore, Registry};
use crate::snapshot::{FileInfo, TrackedSnapshot};
use crate::state::SyncState;
use crate::tracked::TrackedSet;

/// Everything a push apply needs, computed up front
#[derive(Debug)]
pub struct PushPlan {
    pub tag: String,
    /// The tag's digest when the plan was built; `None` for a fresh tag
    pub previous_digest: Option<Digest>,
    /// The index that will become the new config blob
    pub index: BundleIndex,
    /// Canonical index bytes; their digest is the config descriptor
    pub index_bytes: Vec<u8>,
    /// Manifest bytes to publish
    pub manifest_bytes: Vec<u8>,
    /// Registry-layer files whose blobs the registry does not have yet
    pub uploads_oci: Vec<FileInfo>,
    /// Blob-storage files missing from the store, with their target URIs
    pub uploads_blob: Vec<(FileInfo, String)>,
    /// Paths that disappear from the remote (mirror semantics)
    pub deletes: Vec<BundlePath>,
    /// Paths already in sync, for reporting
    pub unchanged: Vec<BundlePath>,
    /// Remote file set at plan time, for the no-op check
    remote_digests: Vec<(BundlePath, Digest)>,
}

impl PushPlan {
    /// True when applying would publish a manifest identical in content to
    /// the one the tag already points at.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        if self.previous_digest.is_none()
            || !self.uploads_oci.is_empty()
            || !self.uploads_blob.is_empty()
        {
            return false;
        }
        let new: Vec<(BundlePath, Digest)> = self
            .index
            .files
            .iter()
            .map(|(p, e)| (p.clone(), e.digest))
            .collect();
        new == self.remote_digests
    }

    /// Bytes that apply will transfer.
    #[must_use]
    pub fn total_upload_size(&self) -> u64 {
        let oci: u64 = self.uploads_oci.iter().map(|f| f.size).sum();
        let blob: u64 = self.uploads_blob.iter().map(|(f, _)| f.size).sum();
        oci + blob
    }
}

/// Build a push plan for the current snapshot.
///
/// # Errors
/// `TagMoved` when the tag no longer matches our last push and `force` is
/// unset; `Config` when blob storage is required but unavailable; registry
/// errors propagate.
pub async fn plan_push(
    registry: &dyn Registry,
    blob_store: Option<&dyn BlobStore>,
    policy: &StoragePolicy,
    snapshot: &TrackedSnapshot,
    state: &SyncState,
    tag: &str,
    force: bool,
) -> Result<PushPlan> {
    let resolved = registry.resolve_tag(tag).await?;
    let previous_digest = resolved.as_ref().map(|r| r.digest);

    if !state.matches_remote(previous_digest.as_ref()) && !force {
        return Err(BundleError::TagMoved {
            tag: tag.to_string(),
            expected: describe(state.expected_remote()),
            actual: describe(previous_digest.as_ref()),
        });
    }

    let remote = match &resolved {
        Some(resolved) => {
            let manifest = OciManifest::from_slice(&resolved.manifest)?;
            let index_bytes = fetch_blob_bytes(registry, &manifest.config.digest).await?;
            let index = BundleIndex::from_slice(&index_bytes)?;
            RemoteState::from_index(resolved.digest, &index)
        }
        None => RemoteState::absent(),
    };

    let diff = compute_diff(snapshot, &remote, state);

    // Mirror semantics: the new index is exactly the local tracked set
    let mut entries = Vec::new();
    for info in snapshot.files.values() {
        let storage = policy.classify(&info.path, info.size)?;
        let blob_ref = match storage {
            StorageKind::Blob => {
                let location = policy.blob_location().ok_or_else(|| {
                    BundleError::Config("blob storage required but not configured".into())
                })?;
                Some(BlobRef {
                    uri: location.uri_for(&info.digest),
                })
            }
            StorageKind::Oci => None,
        };
        entries.push(FileEntry {
            path: info.path.clone(),
            digest: info.digest,
            size: info.size,
            storage,
            blob_ref,
        });
    }
    let index = BundleIndex::new(entries)?;
    let index_bytes = index.canonical_bytes()?;
    let manifest_bytes = OciManifest::for_index(&index, &index_bytes).to_bytes()?;

    // Content-level dedup: a digest the previous manifest already carried
    // needs no re-upload, whatever path it now lives at.
    let prev_digests: HashSet<Digest> = remote.files.values().map(|f| f.digest).collect();

    let mut uploads_oci = Vec::new();
    let mut uploads_blob = Vec::new();
    for entry in index.files.values() {
        let info = FileInfo {
            path: entry.path.clone(),
            digest: entry.digest,
            size: entry.size,
        };
        match entry.storage {
            StorageKind::Oci => {
                if !prev_digests.contains(&entry.digest) {
                    uploads_oci.push(info);
                }
            }
            StorageKind::Blob => {
                let store = blob_store.ok_or_else(|| {
                    BundleError::Config(
                        "bundle needs blob storage but no provider client is available".into(),
                    )
                })?;
                if !store.exists_by_digest(&entry.digest).await? {
                    let uri = entry
                        .blob_ref
                        .as_ref()
                        .expect("blob entries always carry a blobRef")
                        .uri
                        .clone();
                    uploads_blob.push((info, uri));
                }
            }
        }
    }

    let deletes = diff
        .paths_in(FileState::DeletedLocal)
        .into_iter()
        .cloned()
        .collect();
    let unchanged = diff
        .paths_in(FileState::Unchanged)
        .into_iter()
        .cloned()
        .collect();
    let remote_digests = remote
        .files
        .iter()
        .map(|(p, f)| (p.clone(), f.digest))
        .collect();

    debug!(
        tag,
        oci = uploads_oci.len(),
        blob = uploads_blob.len(),
        "push plan ready"
    );
    Ok(PushPlan {
        tag: tag.to_string(),
        previous_digest,
        index,
        index_bytes,
        manifest_bytes,
        uploads_oci,
        uploads_blob,
        deletes,
        unchanged,
        remote_digests,
    })
}

/// Flags controlling pull behavior
#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    /// Proceed even when the pull would overwrite or delete local changes
    pub overwrite: bool,
    /// Also delete locally-added files, making the tree an exact mirror
    pub mirror: bool,
}

/// Everything a pull apply needs, resolved by digest
#[derive(Debug)]
pub struct PullPlan {
    /// What the user asked for (tag or digest)
    pub reference: String,
    /// The digest every content operation uses
    pub resolved_digest: Digest,
    /// The remote's authoritative file manifest
    pub index: BundleIndex,
    /// Entries to download and materialize
    pub fetches: Vec<FileEntry>,
    /// Local files to remove
    pub deletions: Vec<BundlePath>,
}

impl PullPlan {
    /// Bytes that apply will download (cache misses included).
    #[must_use]
    pub fn total_download_size(&self) -> u64 {
        self.fetches.iter().map(|e| e.size).sum()
    }
}

/// Build a pull plan for a tag or digest reference.
///
/// # Errors
/// `SafetyGuard` when the pull would clobber local modifications, delete
/// local files, overwrite untracked files, or resolve conflicts, and
/// `overwrite` is unset. `NotFound` for an absent tag.
pub async fn plan_pull(
    registry: &dyn Registry,
    snapshot: &TrackedSnapshot,
    tracked: &TrackedSet,
    state: &SyncState,
    root: &Path,
    reference: &str,
    opts: PullOptions,
) -> Result<PullPlan> {
    // Resolve once; everything after this line operates by digest
    let (resolved_digest, manifest_bytes) = if reference.starts_with("sha256:") {
        let digest = Digest::parse(reference)?;
        (digest, registry.get_manifest(&digest).await?)
    } else {
        let resolved = registry
            .resolve_tag(reference)
            .await?
            .ok_or_else(|| BundleError::NotFound(format!("tag '{reference}' not found")))?;
        (resolved.digest, resolved.manifest)
    };

    let manifest = OciManifest::from_slice(&manifest_bytes)?;
    let index_bytes = fetch_blob_bytes(registry, &manifest.config.digest).await?;
    let index = BundleIndex::from_slice(&index_bytes)?;
    let remote = RemoteState::from_index(resolved_digest, &index);

    let diff = compute_diff(snapshot, &remote, state);

    if !opts.overwrite {
        let conflicts = diff.count(FileState::Conflict);
        let local_mods = diff.count(FileState::ModifiedLocal);
        let remote_deletes = diff.count(FileState::DeletedRemote);
        let untracked = untracked_collisions(&index, tracked, root).len();

        if conflicts + local_mods + remote_deletes + untracked > 0 {
            let mut parts = Vec::new();
            if conflicts > 0 {
                parts.push(format!("{conflicts} conflicting"));
            }
            if local_mods > 0 {
                parts.push(format!("{local_mods} locally modified"));
            }
            if remote_deletes > 0 {
                parts.push(format!("{remote_deletes} would be deleted"));
            }
            if untracked > 0 {
                parts.push(format!("{untracked} untracked would be overwritten"));
            }
            return Err(BundleError::SafetyGuard(parts.join(", ")));
        }
    }

    // Fetch whatever the remote has that the tree does not
    let fetches: Vec<FileEntry> = index
        .files
        .values()
        .filter(|entry| {
            snapshot
                .files
                .get(&entry.path)
                .is_none_or(|local| local.digest != entry.digest)
        })
        .cloned()
        .collect();

    // Mirror deletions: locally present, known at last sync, gone remotely
    let mut deletions: Vec<BundlePath> = diff
        .changes
        .iter()
        .filter(|c| c.local.is_some() && c.last_synced.is_some() && c.remote.is_none())
        .map(|c| c.path.clone())
        .collect();
    if opts.mirror {
        deletions.extend(diff.paths_in(FileState::AddedLocal).into_iter().cloned());
    }
    deletions.sort();
    deletions.dedup();

    debug!(
        reference,
        digest = %resolved_digest.short(),
        fetches = fetches.len(),
        deletions = deletions.len(),
        "pull plan ready"
    );
    Ok(PullPlan {
        reference: reference.to_string(),
        resolved_digest,
        index,
        fetches,
        deletions,
    })
}

/// Remote paths that exist on disk but are not tracked; pulling would
/// overwrite files the user never handed to us.
fn untracked_collisions(index: &BundleIndex, tracked: &TrackedSet, root: &Path) -> Vec<BundlePath> {
    index
        .files
        .keys()
        .filter(|path| !tracked.contains(path) && path.to_native(root).exists())
        .cloned()
        .collect()
}

fn describe(digest: Option<&Digest>) -> String {
    digest.map_or_else(|| "(absent)".to_string(), ToString::to_string)
}
