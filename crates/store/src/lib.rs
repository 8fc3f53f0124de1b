//! mobundle-store: remote storage implementations
//!
//! Concrete `Registry` and `BlobStore` implementations behind the interfaces
//! `mobundle-core` defines: an in-process registry for tests and local
//! workflows, a sharded filesystem blob store (the `fs` provider), and the
//! retry policy for transient network failures.

pub mod dir_registry;
pub mod fs;
pub mod memory;
pub mod retry;

use std::sync::Arc;

pub use dir_registry::DirRegistry;
pub use fs::FsBlobStore;
pub use memory::MemoryRegistry;
pub use retry::with_retry;

use mobundle_core::{BlobStore, BundleError, Registry, Result, StorageSettings};

/// Build a registry client for a `registry_ref`.
///
/// `file://<dir>` references get the directory-backed registry. Network
/// registries need an HTTP client that lives outside this workspace.
///
/// # Errors
/// `Config` for references this build cannot serve.
pub fn make_registry(registry_ref: &str) -> Result<Arc<dyn Registry>> {
    if registry_ref.starts_with("file://") {
        return Ok(Arc::new(DirRegistry::from_ref(registry_ref)?));
    }
    Err(BundleError::Config(format!(
        "registry {registry_ref:?} needs an OCI HTTP client that is not part of this build; \
         use a file:// registry"
    )))
}

/// Build the blob store a configuration calls for.
///
/// Returns `None` for OCI-only configurations. Cloud providers need
/// credentialed clients that live outside this workspace, so asking for one
/// here is a configuration error rather than a silent fallback.
///
/// # Errors
/// `Config` for providers this build cannot serve.
pub fn make_blob_store(settings: &StorageSettings) -> Result<Option<Arc<dyn BlobStore>>> {
    let Some(location) = settings.blob_location() else {
        return Ok(None);
    };

    match location.provider.as_str() {
        "fs" => Ok(Some(Arc::new(FsBlobStore::new(location)?))),
        other => Err(BundleError::Config(format!(
            "storage.provider {other:?} requires an external client that is not part of this build"
        ))),
    }
}
