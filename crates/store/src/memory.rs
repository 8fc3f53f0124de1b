//! In-process registry for tests and local workflows
//!
//! Stores manifests, blobs, and tags in memory behind a mutex. Serves
//! digests computed over the exact stored bytes, which is the contract real
//! registries honor through their content-digest headers; the engine never
//! recomputes a manifest digest from re-serialized JSON.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use mobundle_core::{BundleError, Digest, Registry, ResolvedTag, Result};

/// An OCI registry living entirely in process memory
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    manifests: HashMap<Digest, Vec<u8>>,
    blobs: HashMap<Digest, Vec<u8>>,
    tags: HashMap<String, Digest>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point a tag at a digest directly. Test hook for simulating a
    /// concurrent push moving the tag under us.
    pub fn set_tag(&self, tag: &str, digest: Digest) {
        self.lock().tags.insert(tag.to_string(), digest);
    }

    /// Replace a stored blob's bytes without touching its key. Test hook for
    /// simulating registry-side corruption; a pull of this digest must fail
    /// digest verification.
    pub fn corrupt_blob(&self, digest: &Digest, bytes: &[u8]) {
        self.lock().blobs.insert(*digest, bytes.to_vec());
    }

    /// Number of stored blobs, for dedup assertions.
    #[must_use]
    pub fn blob_count(&self) -> usize {
        self.lock().blobs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry mutex poisoned")
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn resolve_tag(&self, tag: &str) -> Result<Option<ResolvedTag>> {
        let inner = self.lock();
        let Some(digest) = inner.tags.get(tag) else {
            return Ok(None);
        };
        let manifest = inner
            .manifests
            .get(digest)
            .ok_or_else(|| BundleError::NotFound(format!("manifest {digest} missing for tag {tag}")))?
            .clone();
        Ok(Some(ResolvedTag {
            digest: *digest,
            manifest,
        }))
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        self.lock()
            .manifests
            .get(digest)
            .cloned()
            .ok_or_else(|| BundleError::NotFound(format!("manifest {digest} not found")))
    }

    async fn get_blob(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let bytes = self
            .lock()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| BundleError::NotFound(format!("blob {digest} not found")))?;
        tokio::fs::write(dest, bytes).await?;
        Ok(())
    }

    async fn put_blob(&self, digest: &Digest, src: &Path) -> Result<()> {
        let bytes = tokio::fs::read(src).await?;
        let actual = Digest::of_bytes(&bytes);
        if actual != *digest {
            // A registry rejects a blob whose content does not match its
            // declared digest
            return Err(BundleError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        let mut inner = self.lock();
        if inner.blobs.contains_key(digest) {
            debug!(digest = %digest.short(), "blob already present");
            return Ok(());
        }
        inner.blobs.insert(*digest, bytes);
        Ok(())
    }

    async fn put_manifest(&self, manifest: &[u8], tag: Option<&str>) -> Result<Digest> {
        // The registry's digest is over the bytes exactly as received
        let digest = Digest::of_bytes(manifest);
        let mut inner = self.lock();
        inner.manifests.insert(digest, manifest.to_vec());
        if let Some(tag) = tag {
            inner.tags.insert(tag.to_string(), digest);
        }
        Ok(digest)
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self.lock().tags.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }

    async fn get_tag(&self, tag: &str) -> Result<Option<Digest>> {
        Ok(self.lock().tags.get(tag).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manifest_and_tag_lifecycle() {
        let registry = MemoryRegistry::new();
        assert!(registry.resolve_tag("latest").await.unwrap().is_none());

        let digest = registry
            .put_manifest(b"{\"fake\":1}", Some("latest"))
            .await
            .unwrap();
        assert_eq!(digest, Digest::of_bytes(b"{\"fake\":1}"));

        let resolved = registry.resolve_tag("latest").await.unwrap().unwrap();
        assert_eq!(resolved.digest, digest);
        assert_eq!(resolved.manifest, b"{\"fake\":1}");
        assert_eq!(registry.get_tag("latest").await.unwrap(), Some(digest));
        assert_eq!(registry.list_tags().await.unwrap(), vec!["latest"]);
    }

    #[tokio::test]
    async fn test_put_blob_is_idempotent_and_verifying() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("blob");
        std::fs::write(&src, b"content").unwrap();
        let digest = Digest::of_bytes(b"content");

        let registry = MemoryRegistry::new();
        registry.put_blob(&digest, &src).await.unwrap();
        registry.put_blob(&digest, &src).await.unwrap();
        assert_eq!(registry.blob_count(), 1);

        let wrong = Digest::of_bytes(b"other");
        let err = registry.put_blob(&wrong, &src).await.unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn test_get_blob_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in");
        std::fs::write(&src, b"payload").unwrap();
        let digest = Digest::of_bytes(b"payload");

        let registry = MemoryRegistry::new();
        registry.put_blob(&digest, &src).await.unwrap();

        let dest = dir.path().join("out");
        registry.get_blob(&digest, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let registry = MemoryRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let err = registry
            .get_blob(&Digest::of_bytes(b"nope"), &dir.path().join("x"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
