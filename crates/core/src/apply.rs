//! Plan execution: the "do" half of plan/apply
//!
//! Content transfers run concurrently up to a bounded limit and are
//! idempotent by digest, so a failed or canceled apply can simply run again.
//! Sync state and the tracked set are written only after every content
//! operation has succeeded; a crash at any earlier point leaves both files
//! pointing at the previous version.

use std::io::Write;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::cas::LocalCas;
use crate::digest::Digest;
use crate::error::{BundleError, Result};
use crate::plan::{PullPlan, PushPlan};
use crate::policy::StorageKind;
use crate::project::ProjectContext;
use crate::remote::{BlobStore, Registry};

/// Default bound on concurrent transfers
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Default per-blob transfer timeout
pub const DEFAULT_TRANSFER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

/// Cooperative cancellation signal, checked at every transfer boundary
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signal cancellation. In-flight transfers abort at their next await
    /// point; persistent state is never mutated after this.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when (and only when) cancellation is signaled.
    pub async fn canceled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|v| *v).await.is_err() {
            // All senders gone without a cancel; never resolve
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Knobs for apply execution
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum concurrent uploads or downloads
    pub concurrency: usize,
    /// Per-blob transfer deadline; overruns surface as `Network` errors
    pub transfer_timeout: std::time::Duration,
    pub cancel: CancelToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            cancel: CancelToken::new(),
        }
    }
}

/// Race a transfer against the cancellation token and the per-blob
/// deadline.
async fn bounded<F>(cancel: &CancelToken, timeout: std::time::Duration, work: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        () = cancel.canceled() => Err(BundleError::Canceled),
        res = tokio::time::timeout(timeout, work) => match res {
            Ok(res) => res,
            Err(_) => Err(BundleError::Network(format!(
                "transfer did not finish within {timeout:?}"
            ))),
        },
    }
}

/// Outcome of a pull apply
#[derive(Debug, Clone)]
pub struct PullReport {
    pub downloaded: usize,
    pub deleted: usize,
    pub manifest_digest: Digest,
}

/// Execute a push plan.
///
/// Uploads all blob and layer content (idempotent by digest), publishes the
/// config blob and manifest, and only then updates the sync state. The tag
/// is re-checked immediately before the manifest write; if it moved since
/// planning, nothing is published and `TagMoved` is returned — the uploaded
/// blobs are harmless orphans a registry GC may collect.
///
/// # Errors
/// `TagMoved`, `Canceled`, and any transfer error; sync state is untouched
/// on every error path.
pub async fn apply_push(
    ctx: &ProjectContext,
    registry: Arc<dyn Registry>,
    blob_store: Option<Arc<dyn BlobStore>>,
    plan: &PushPlan,
    opts: &ApplyOptions,
) -> Result<Digest> {
    let cancel = &opts.cancel;
    if cancel.is_canceled() {
        return Err(BundleError::Canceled);
    }

    // External blobs first: cheapest to orphan if the push later aborts
    if !plan.uploads_blob.is_empty() {
        let store = blob_store.ok_or_else(|| {
            BundleError::Config("bundle needs blob storage but no provider client is available".into())
        })?;
        let mut tasks = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(opts.concurrency));
        for (info, _uri) in plan.uploads_blob.clone() {
            let store = store.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let timeout = opts.transfer_timeout;
            let src = info.path.to_native(ctx.root());
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closes");
                bounded(&cancel, timeout, async {
                    store.put_by_digest(&info.digest, &src).await.map(|_| ())
                })
                .await
            });
        }
        join_all(tasks).await?;
    }

    // Registry layer blobs
    let mut tasks = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency));
    for info in plan.uploads_oci.clone() {
        let registry = registry.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let timeout = opts.transfer_timeout;
        let src = info.path.to_native(ctx.root());
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closes");
            bounded(&cancel, timeout, registry.put_blob(&info.digest, &src)).await
        });
    }
    join_all(tasks).await?;

    if cancel.is_canceled() {
        return Err(BundleError::Canceled);
    }

    // Config blob: the canonical index bytes
    let index_digest = Digest::of_bytes(&plan.index_bytes);
    let mut config_file = tempfile::NamedTempFile::new()?;
    config_file.write_all(&plan.index_bytes)?;
    config_file.flush()?;
    registry.put_blob(&index_digest, config_file.path()).await?;

    // Compare-and-set: re-resolve the tag right before the manifest write
    let current = registry.get_tag(&plan.tag).await?;
    if current != plan.previous_digest {
        return Err(BundleError::TagMoved {
            tag: plan.tag.clone(),
            expected: plan
                .previous_digest
                .map_or_else(|| "(absent)".to_string(), |d| d.to_string()),
            actual: current.map_or_else(|| "(absent)".to_string(), |d| d.to_string()),
        });
    }

    let manifest_digest = registry
        .put_manifest(&plan.manifest_bytes, Some(&plan.tag))
        .await?;

    // Content is published; now, and only now, move our base forward
    let mut state = ctx.load_state()?;
    state.record_push(manifest_digest, plan.index.file_digests());
    state.save(&ctx.state_path())?;

    info!(
        tag = plan.tag,
        digest = %manifest_digest.short(),
        uploaded = plan.uploads_oci.len() + plan.uploads_blob.len(),
        "push complete"
    );
    Ok(manifest_digest)
}

/// Execute a pull plan.
///
/// Every file flows download → verify → promote through the local CAS, then
/// materializes into the working tree; mirror deletions and the tracked and
/// sync-state updates happen only after all content is in place.
///
/// # Errors
/// `Config` if the remote needs blob storage we do not have (checked before
/// any I/O), `DigestMismatch` for corrupt content, `Canceled`; persistent
/// state is untouched on every error path.
pub async fn apply_pull(
    ctx: &ProjectContext,
    registry: Arc<dyn Registry>,
    blob_store: Option<Arc<dyn BlobStore>>,
    cas: &LocalCas,
    plan: &PullPlan,
    opts: &ApplyOptions,
) -> Result<PullReport> {
    let cancel = &opts.cancel;
    if cancel.is_canceled() {
        return Err(BundleError::Canceled);
    }

    let needs_blob = plan
        .fetches
        .iter()
        .any(|e| e.storage == StorageKind::Blob);
    if needs_blob && blob_store.is_none() {
        return Err(BundleError::Config(
            "bundle contains blob-storage files but no storage.provider is configured".into(),
        ));
    }

    let link_mode = ctx.load_config()?.cache_link_mode;

    let mut tasks = JoinSet::new();
    let semaphore = Arc::new(Semaphore::new(opts.concurrency));
    for entry in plan.fetches.clone() {
        let registry = registry.clone();
        let blob_store = blob_store.clone();
        let cas = cas.clone();
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let timeout = opts.transfer_timeout;
        let dest = entry.path.to_native(ctx.root());

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closes");

            let work = async {
                cas.ensure_present(&entry.digest, |tmp| {
                    let registry = registry.clone();
                    let blob_store = blob_store.clone();
                    let entry = entry.clone();
                    async move {
                        match entry.storage {
                            StorageKind::Oci => registry.get_blob(&entry.digest, &tmp).await,
                            StorageKind::Blob => {
                                let blob_ref = entry
                                    .blob_ref
                                    .as_ref()
                                    .expect("blob entries always carry a blobRef");
                                let store = blob_store
                                    .as_ref()
                                    .expect("checked before spawning fetches");
                                store.get_by_digest(blob_ref, &tmp).await
                            }
                        }
                    }
                })
                .await?;

                let cas = cas.clone();
                let digest = entry.digest;
                tokio::task::spawn_blocking(move || cas.materialize(&digest, &dest, link_mode))
                    .await
                    .map_err(|e| BundleError::Io(std::io::Error::other(e)))?
            };

            bounded(&cancel, timeout, work).await
        });
    }
    join_all(tasks).await?;

    if cancel.is_canceled() {
        return Err(BundleError::Canceled);
    }

    // Mirror deletions, after all new content is safely in place
    let mut deleted = 0;
    for path in &plan.deletions {
        let native = path.to_native(ctx.root());
        match std::fs::remove_file(&native) {
            Ok(()) => {
                debug!(path = %path, "deleted (mirror)");
                deleted += 1;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    // The tracked set becomes exactly the remote file set
    let mut tracked = ctx.load_tracked()?;
    tracked.replace_with(plan.index.files.keys().cloned());
    tracked.save(&ctx.tracked_path())?;

    let mut state = ctx.load_state()?;
    state.record_pull(plan.resolved_digest, plan.index.file_digests());
    state.save(&ctx.state_path())?;

    info!(
        digest = %plan.resolved_digest.short(),
        downloaded = plan.fetches.len(),
        deleted,
        "pull complete"
    );
    Ok(PullReport {
        downloaded: plan.fetches.len(),
        deleted,
        manifest_digest: plan.resolved_digest,
    })
}

/// Drain a join set, surfacing the first task error and aborting the rest.
async fn join_all(mut tasks: JoinSet<Result<()>>) -> Result<()> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(e) => {
                tasks.abort_all();
                return Err(BundleError::Io(std::io::Error::other(e)));
            }
        }
    }
    Ok(())
}
