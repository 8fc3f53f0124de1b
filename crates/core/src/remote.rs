//! Interfaces the core requires from remote storage
//!
//! The engine never talks HTTP itself; it drives these two traits. Registry
//! and blob-store implementations live outside the core and are expected to
//! be concurrency-safe and idempotent under content-addressed puts.

use std::path::Path;

use async_trait::async_trait;

use crate::digest::Digest;
use crate::error::Result;
use crate::index::BlobRef;

/// A tag resolution: the registry's own digest plus the exact manifest bytes
/// as served.
///
/// The digest must come from the registry's content-digest metadata (or, at
/// worst, be hashed over the exact response bytes). Re-serializing the
/// manifest would change whitespace and therefore the digest.
#[derive(Debug, Clone)]
pub struct ResolvedTag {
    pub digest: Digest,
    pub manifest: Vec<u8>,
}

/// An OCI registry holding bundle artifacts
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a tag to its current digest and raw manifest bytes.
    /// `Ok(None)` means the tag does not exist.
    async fn resolve_tag(&self, tag: &str) -> Result<Option<ResolvedTag>>;

    /// Fetch a manifest by digest.
    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Stream a blob's contents into `dest`.
    async fn get_blob(&self, digest: &Digest, dest: &Path) -> Result<()>;

    /// Upload a blob from a local file. Idempotent: succeeds immediately if
    /// the registry already has the digest.
    async fn put_blob(&self, digest: &Digest, src: &Path) -> Result<()>;

    /// Write a manifest and, if a tag is given, point the tag at it.
    /// Returns the registry's digest for the manifest.
    async fn put_manifest(&self, manifest: &[u8], tag: Option<&str>) -> Result<Digest>;

    /// All tags in the repository.
    async fn list_tags(&self) -> Result<Vec<String>>;

    /// Current digest of a tag, or `None` if absent. Lighter than
    /// `resolve_tag`: no manifest body.
    async fn get_tag(&self, tag: &str) -> Result<Option<Digest>>;
}

/// External blob storage addressed purely by digest
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Upload a file under its digest-derived key. Idempotent.
    async fn put_by_digest(&self, digest: &Digest, src: &Path) -> Result<BlobRef>;

    /// Download the referenced blob into `dest`. The caller verifies the
    /// digest; the store does not.
    async fn get_by_digest(&self, blob_ref: &BlobRef, dest: &Path) -> Result<()>;

    /// Whether the digest is already stored.
    async fn exists_by_digest(&self, digest: &Digest) -> Result<bool>;

    /// The content-addressed URI a digest maps to. Pure; no I/O.
    fn uri_for(&self, digest: &Digest) -> String;
}

/// Fetch a small blob (config-sized) into memory via a temp file.
///
/// # Errors
/// Propagates registry and I/O errors.
pub async fn fetch_blob_bytes(registry: &dyn Registry, digest: &Digest) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("blob");
    registry.get_blob(digest, &path).await?;
    Ok(std::fs::read(&path)?)
}
