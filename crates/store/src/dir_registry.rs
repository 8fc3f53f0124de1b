//! Directory-backed registry: `file://` references
//!
//! A registry living in a local directory, for air-gapped workflows and for
//! exercising the full push/pull path without a registry server. Layout:
//!
//! ```text
//! <root>/
//!   blobs/sha256/<hex>
//!   manifests/<hex>
//!   tags/<name>          # contains "sha256:<hex>"
//! ```
//!
//! Tag writes go through temp-file + rename, so a reader never sees a
//! half-written digest.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use mobundle_core::atomic::write_atomic;
use mobundle_core::{BundleError, Digest, Registry, ResolvedTag, Result};

/// Registry rooted at a local directory
#[derive(Debug)]
pub struct DirRegistry {
    root: PathBuf,
}

impl DirRegistry {
    /// Open (creating if needed) a registry at `root`.
    ///
    /// # Errors
    /// `Io` if the layout cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs").join("sha256"))?;
        std::fs::create_dir_all(root.join("manifests"))?;
        std::fs::create_dir_all(root.join("tags"))?;
        Ok(Self { root })
    }

    /// Open from a `file://<path>` registry reference.
    ///
    /// # Errors
    /// `InvalidInput` for other schemes.
    pub fn from_ref(registry_ref: &str) -> Result<Self> {
        let path = registry_ref.strip_prefix("file://").ok_or_else(|| {
            BundleError::InvalidInput(format!("expected file:// registry ref, got {registry_ref:?}"))
        })?;
        Self::open(path)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join("sha256").join(digest.hex())
    }

    fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("manifests").join(digest.hex())
    }

    fn tag_path(&self, tag: &str) -> Result<PathBuf> {
        // Tags become file names; keep them boring
        if tag.is_empty()
            || !tag
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
        {
            return Err(BundleError::InvalidInput(format!("invalid tag name: {tag:?}")));
        }
        Ok(self.root.join("tags").join(tag))
    }
}

#[async_trait]
impl Registry for DirRegistry {
    async fn resolve_tag(&self, tag: &str) -> Result<Option<ResolvedTag>> {
        let Some(digest) = self.get_tag(tag).await? else {
            return Ok(None);
        };
        let manifest = self.get_manifest(&digest).await?;
        Ok(Some(ResolvedTag { digest, manifest }))
    }

    async fn get_manifest(&self, digest: &Digest) -> Result<Vec<u8>> {
        match tokio::fs::read(self.manifest_path(digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BundleError::NotFound(format!("manifest {digest} not found")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_blob(&self, digest: &Digest, dest: &Path) -> Result<()> {
        let src = self.blob_path(digest);
        if !src.is_file() {
            return Err(BundleError::NotFound(format!("blob {digest} not found")));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest).await?;
        Ok(())
    }

    async fn put_blob(&self, digest: &Digest, src: &Path) -> Result<()> {
        let dest = self.blob_path(digest);
        if dest.is_file() {
            debug!(digest = %digest.short(), "blob already present");
            return Ok(());
        }

        let bytes = tokio::fs::read(src).await?;
        let actual = Digest::of_bytes(&bytes);
        if actual != *digest {
            return Err(BundleError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        write_atomic(&dest, &bytes)?;
        Ok(())
    }

    async fn put_manifest(&self, manifest: &[u8], tag: Option<&str>) -> Result<Digest> {
        // The registry's digest is over the bytes exactly as received
        let digest = Digest::of_bytes(manifest);
        write_atomic(&self.manifest_path(&digest), manifest)?;
        if let Some(tag) = tag {
            write_atomic(&self.tag_path(tag)?, digest.to_string().as_bytes())?;
        }
        Ok(digest)
    }

    async fn list_tags(&self) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut entries = tokio::fs::read_dir(self.root.join("tags")).await?;
        while let Some(entry) = entries.next_entry().await? {
            tags.push(entry.file_name().to_string_lossy().into_owned());
        }
        tags.sort();
        Ok(tags)
    }

    async fn get_tag(&self, tag: &str) -> Result<Option<Digest>> {
        match tokio::fs::read_to_string(self.tag_path(tag)?).await {
            Ok(text) => Ok(Some(Digest::parse(text.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manifest_tag_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirRegistry::open(dir.path()).unwrap();

        let digest = registry
            .put_manifest(b"manifest-bytes", Some("v1"))
            .await
            .unwrap();
        assert_eq!(digest, Digest::of_bytes(b"manifest-bytes"));

        let resolved = registry.resolve_tag("v1").await.unwrap().unwrap();
        assert_eq!(resolved.digest, digest);
        assert_eq!(resolved.manifest, b"manifest-bytes");
        assert_eq!(registry.list_tags().await.unwrap(), vec!["v1"]);
        assert!(registry.resolve_tag("v2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blob_roundtrip_and_verification() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirRegistry::open(dir.path().join("reg")).unwrap();

        let src = dir.path().join("blob");
        std::fs::write(&src, b"content").unwrap();
        let digest = Digest::of_bytes(b"content");

        registry.put_blob(&digest, &src).await.unwrap();
        let out = dir.path().join("out");
        registry.get_blob(&digest, &out).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"content");

        let wrong = Digest::of_bytes(b"something else");
        let err = registry.put_blob(&wrong, &src).await.unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn test_tag_moves_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirRegistry::open(dir.path()).unwrap();

        let d1 = registry.put_manifest(b"one", Some("latest")).await.unwrap();
        assert_eq!(registry.get_tag("latest").await.unwrap(), Some(d1));

        let d2 = registry.put_manifest(b"two", Some("latest")).await.unwrap();
        assert_eq!(registry.get_tag("latest").await.unwrap(), Some(d2));
        // The first manifest is still addressable by digest
        assert_eq!(registry.get_manifest(&d1).await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_hostile_tag_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DirRegistry::open(dir.path()).unwrap();
        let err = registry.get_tag("../../etc/passwd").await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_from_ref() {
        let dir = tempfile::tempdir().unwrap();
        let reg_ref = format!("file://{}", dir.path().join("r").display());
        DirRegistry::from_ref(&reg_ref).unwrap();
        assert!(DirRegistry::from_ref("ghcr.io/org/repo").is_err());
    }
}
