//! Storage policy: which files become OCI layers, which go to blob storage
//!
//! Decision order: force-OCI patterns, then force-BLOB patterns, then the
//! global mode, then the size threshold (auto mode). Requiring blob storage
//! without a configured provider is a configuration error, surfaced at plan
//! time so apply never discovers it mid-upload.

use std::fmt;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{BundleError, Result};
use crate::path::BundlePath;

/// Default auto-mode threshold: 50 MiB
pub const DEFAULT_THRESHOLD_BYTES: u64 = 50 * 1024 * 1024;

/// Where a file's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A content-addressed layer in the OCI registry
    Oci,
    /// An object in external blob storage
    Blob,
}

/// Global placement mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    /// Threshold-based hybrid placement
    #[default]
    Auto,
    /// Everything in registry layers
    OciInline,
    /// Everything in blob storage
    BlobOnly,
}

/// A configured blob destination: provider, container, optional key prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub provider: String,
    pub container: String,
    pub prefix: Option<String>,
}

impl BlobLocation {
    /// Content-addressed URI for a digest:
    /// `<provider>://<container>/[<prefix>/]<d0d1>/<d2d3>/<hex>`.
    ///
    /// Re-uploading the same digest always yields the same URI.
    #[must_use]
    pub fn uri_for(&self, digest: &Digest) -> String {
        let key = self.key_for(digest);
        format!("{}://{}/{}", self.provider, self.container, key)
    }

    /// Sharded object key within the container.
    #[must_use]
    pub fn key_for(&self, digest: &Digest) -> String {
        let sharded = format!("{}/{}/{}", digest.shard1(), digest.shard2(), digest.hex());
        match &self.prefix {
            Some(prefix) => format!("{prefix}/{sharded}"),
            None => sharded,
        }
    }
}

/// Compiled placement policy
pub struct StoragePolicy {
    mode: StorageMode,
    threshold_bytes: u64,
    force_oci: GlobSet,
    force_blob: GlobSet,
    blob_location: Option<BlobLocation>,
}

impl StoragePolicy {
    /// Compile a policy.
    ///
    /// # Errors
    /// Returns `InvalidInput` for an uncompilable glob, and `Config` when
    /// the mode requires blob storage but no provider is configured.
    pub fn new(
        mode: StorageMode,
        threshold_bytes: u64,
        force_oci_patterns: &[String],
        force_blob_patterns: &[String],
        blob_location: Option<BlobLocation>,
    ) -> Result<Self> {
        if mode == StorageMode::BlobOnly && blob_location.is_none() {
            return Err(BundleError::Config(
                "storage.mode is blob-only but no storage.provider is configured".into(),
            ));
        }

        Ok(Self {
            mode,
            threshold_bytes,
            force_oci: compile_globs(force_oci_patterns)?,
            force_blob: compile_globs(force_blob_patterns)?,
            blob_location,
        })
    }

    /// The configured blob destination, if any.
    #[must_use]
    pub fn blob_location(&self) -> Option<&BlobLocation> {
        self.blob_location.as_ref()
    }

    /// Classify one file.
    ///
    /// # Errors
    /// Returns `Config` when the rules demand blob storage and no provider
    /// is configured. In auto mode, an oversized file without a provider
    /// falls back to OCI instead of erroring.
    pub fn classify(&self, path: &BundlePath, size: u64) -> Result<StorageKind> {
        if self.force_oci.is_match(path.as_str()) {
            return Ok(StorageKind::Oci);
        }
        if self.force_blob.is_match(path.as_str()) {
            return self.require_blob(path);
        }

        match self.mode {
            StorageMode::OciInline => Ok(StorageKind::Oci),
            StorageMode::BlobOnly => self.require_blob(path),
            StorageMode::Auto => {
                if size >= self.threshold_bytes && self.blob_location.is_some() {
                    Ok(StorageKind::Blob)
                } else {
                    Ok(StorageKind::Oci)
                }
            }
        }
    }

    fn require_blob(&self, path: &BundlePath) -> Result<StorageKind> {
        if self.blob_location.is_some() {
            Ok(StorageKind::Blob)
        } else {
            Err(BundleError::Config(format!(
                "{path} requires blob storage but no storage.provider is configured"
            )))
        }
    }
}

impl fmt::Debug for StoragePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoragePolicy")
            .field("mode", &self.mode)
            .field("threshold_bytes", &self.threshold_bytes)
            .field("blob_location", &self.blob_location)
            .finish_non_exhaustive()
    }
}

fn compile_globs(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| BundleError::InvalidInput(format!("bad glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| BundleError::InvalidInput(format!("cannot compile globs: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> BundlePath {
        BundlePath::parse(s).unwrap()
    }

    fn azure() -> Option<BlobLocation> {
        Some(BlobLocation {
            provider: "azure".into(),
            container: "bundles".into(),
            prefix: None,
        })
    }

    fn auto_policy(location: Option<BlobLocation>) -> StoragePolicy {
        StoragePolicy::new(StorageMode::Auto, DEFAULT_THRESHOLD_BYTES, &[], &[], location).unwrap()
    }

    #[test]
    fn test_threshold_boundary() {
        let policy = auto_policy(azure());
        // Exactly at the threshold goes to blob; one byte under stays OCI
        assert_eq!(
            policy.classify(&p("big.bin"), DEFAULT_THRESHOLD_BYTES).unwrap(),
            StorageKind::Blob
        );
        assert_eq!(
            policy
                .classify(&p("big.bin"), DEFAULT_THRESHOLD_BYTES - 1)
                .unwrap(),
            StorageKind::Oci
        );
    }

    #[test]
    fn test_auto_without_provider_stays_oci() {
        let policy = auto_policy(None);
        assert_eq!(
            policy.classify(&p("big.bin"), u64::MAX).unwrap(),
            StorageKind::Oci
        );
    }

    #[test]
    fn test_force_patterns_take_precedence() {
        let policy = StoragePolicy::new(
            StorageMode::Auto,
            DEFAULT_THRESHOLD_BYTES,
            &["**/*.json".into()],
            &["data/**".into()],
            azure(),
        )
        .unwrap();

        // Tiny file in data/ forced to blob
        assert_eq!(
            policy.classify(&p("data/small.csv"), 10).unwrap(),
            StorageKind::Blob
        );
        // Huge json forced to OCI; force-OCI wins over force-BLOB
        assert_eq!(
            policy.classify(&p("data/index.json"), u64::MAX).unwrap(),
            StorageKind::Oci
        );
    }

    #[test]
    fn test_modes() {
        let oci = StoragePolicy::new(StorageMode::OciInline, 0, &[], &[], azure()).unwrap();
        assert_eq!(oci.classify(&p("x"), u64::MAX).unwrap(), StorageKind::Oci);

        let blob = StoragePolicy::new(StorageMode::BlobOnly, 0, &[], &[], azure()).unwrap();
        assert_eq!(blob.classify(&p("x"), 0).unwrap(), StorageKind::Blob);
    }

    #[test]
    fn test_blob_only_without_provider_is_config_error() {
        let err = StoragePolicy::new(StorageMode::BlobOnly, 0, &[], &[], None).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_force_blob_without_provider_is_config_error() {
        let policy =
            StoragePolicy::new(StorageMode::Auto, 0, &[], &["*.bin".into()], None).unwrap();
        let err = policy.classify(&p("weights.bin"), 1).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_uri_for_is_sharded_and_stable() {
        let loc = BlobLocation {
            provider: "azure".into(),
            container: "ml-artifacts".into(),
            prefix: Some("models".into()),
        };
        let d = Digest::parse(&format!("sha256:abcd{}", "0".repeat(60))).unwrap();
        let uri = loc.uri_for(&d);
        assert_eq!(
            uri,
            format!("azure://ml-artifacts/models/ab/cd/abcd{}", "0".repeat(60))
        );
        assert_eq!(uri, loc.uri_for(&d));
    }
}
