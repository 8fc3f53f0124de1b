//! Filesystem blob store: the `fs` provider
//!
//! Stores blobs under a local directory with the same two-level sharding the
//! blob URI scheme prescribes: `<container>/[<prefix>/]<d0d1>/<d2d3>/<hex>`.
//! Useful for air-gapped setups and as the provider the test suite runs
//! against.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use mobundle_core::{BlobLocation, BlobRef, BlobStore, BundleError, Digest, Result};

/// Blob store rooted at a local directory
#[derive(Debug)]
pub struct FsBlobStore {
    location: BlobLocation,
    base: PathBuf,
}

impl FsBlobStore {
    /// Create the store; the container directory is created if absent.
    ///
    /// # Errors
    /// `Config` for a non-`fs` location, `Io` if the directory cannot be
    /// created.
    pub fn new(location: BlobLocation) -> Result<Self> {
        if location.provider != "fs" {
            return Err(BundleError::Config(format!(
                "FsBlobStore serves provider \"fs\", not {:?}",
                location.provider
            )));
        }
        let base = PathBuf::from(&location.container);
        std::fs::create_dir_all(&base)?;
        Ok(Self { location, base })
    }

    fn path_for(&self, digest: &Digest) -> PathBuf {
        let mut path = self.base.clone();
        if let Some(prefix) = &self.location.prefix {
            path.push(prefix);
        }
        path.join(digest.shard1())
            .join(digest.shard2())
            .join(digest.hex())
    }

    fn path_from_uri(&self, uri: &str) -> Result<PathBuf> {
        let rest = uri.strip_prefix("fs://").ok_or_else(|| {
            BundleError::InvalidInput(format!("expected fs:// URI, got {uri:?}"))
        })?;
        Ok(PathBuf::from(rest))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put_by_digest(&self, digest: &Digest, src: &std::path::Path) -> Result<BlobRef> {
        let dest = self.path_for(digest);
        let blob_ref = BlobRef {
            uri: self.uri_for(digest),
        };

        if dest.is_file() {
            debug!(digest = %digest.short(), "blob already stored");
            return Ok(blob_ref);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Stage then rename so concurrent writers of the same digest cannot
        // expose a half-copied object
        let staging = dest.with_file_name(format!(
            ".{}.put-{}",
            digest.short(),
            std::process::id()
        ));
        tokio::fs::copy(src, &staging).await?;
        if let Err(e) = tokio::fs::rename(&staging, &dest).await {
            let _ = tokio::fs::remove_file(&staging).await;
            if !dest.is_file() {
                return Err(e.into());
            }
        }
        Ok(blob_ref)
    }

    async fn get_by_digest(&self, blob_ref: &BlobRef, dest: &std::path::Path) -> Result<()> {
        let src = self.path_from_uri(&blob_ref.uri)?;
        if !src.is_file() {
            return Err(BundleError::NotFound(format!("blob not found: {}", blob_ref.uri)));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, dest).await?;
        Ok(())
    }

    async fn exists_by_digest(&self, digest: &Digest) -> Result<bool> {
        Ok(self.path_for(digest).is_file())
    }

    fn uri_for(&self, digest: &Digest) -> String {
        self.location.uri_for(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(prefix: Option<&str>) -> (TempDir, FsBlobStore) {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(BlobLocation {
            provider: "fs".into(),
            container: dir.path().join("blobs").to_string_lossy().into_owned(),
            prefix: prefix.map(ToString::to_string),
        })
        .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let (dir, store) = store(None);
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"large weights").unwrap();
        let digest = Digest::of_bytes(b"large weights");

        assert!(!store.exists_by_digest(&digest).await.unwrap());
        let blob_ref = store.put_by_digest(&digest, &src).await.unwrap();
        assert!(store.exists_by_digest(&digest).await.unwrap());

        let dest = dir.path().join("dest.bin");
        store.get_by_digest(&blob_ref, &dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"large weights");
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (dir, store) = store(None);
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"same").unwrap();
        let digest = Digest::of_bytes(b"same");

        let first = store.put_by_digest(&digest, &src).await.unwrap();
        let second = store.put_by_digest(&digest, &src).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_uri_shape_with_prefix() {
        let (_dir, store) = store(Some("models"));
        let digest = Digest::parse(&format!("sha256:abcd{}", "0".repeat(60))).unwrap();
        let uri = store.uri_for(&digest);
        assert!(uri.starts_with("fs://"));
        assert!(uri.ends_with(&format!("/models/ab/cd/abcd{}", "0".repeat(60))));

        // URI is content-addressed: same digest, same URI
        assert_eq!(uri, store.uri_for(&digest));
    }

    #[tokio::test]
    async fn test_sharded_layout_on_disk() {
        let (dir, store) = store(None);
        let src = dir.path().join("f");
        std::fs::write(&src, b"x").unwrap();
        let digest = Digest::of_bytes(b"x");
        store.put_by_digest(&digest, &src).await.unwrap();

        let expected = dir
            .path()
            .join("blobs")
            .join(digest.shard1())
            .join(digest.shard2())
            .join(digest.hex());
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (dir, store) = store(None);
        let blob_ref = BlobRef {
            uri: format!("fs://{}/ab/cd/{}", dir.path().display(), "0".repeat(64)),
        };
        let err = store
            .get_by_digest(&blob_ref, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_foreign_uri_is_rejected() {
        let (dir, store) = store(None);
        let blob_ref = BlobRef {
            uri: "azure://container/ab/cd/ef".into(),
        };
        let err = store
            .get_by_digest(&blob_ref, &dir.path().join("out"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
