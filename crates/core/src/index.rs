//! BundleIndex: the authoritative file manifest of a bundle version
//!
//! Serialized as the OCI config blob. Serialization is canonical (keys
//! sorted, stable formatting) so the same logical index always produces
//! byte-identical output and therefore a stable config digest.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{BundleError, Result};
use crate::path::BundlePath;
use crate::policy::StorageKind;

/// Index schema version
pub const INDEX_VERSION: &str = "1.0";

/// Tool name recorded in every index
pub const TOOL_NAME: &str = "modelops-bundle";

/// Reference to a blob in external storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    /// Content-addressed URI, e.g. `azure://bundles/ab/cd/<hex>`
    pub uri: String,
}

/// One file in the bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: BundlePath,
    pub digest: Digest,
    pub size: u64,
    pub storage: StorageKind,
    /// Present iff `storage` is `Blob`
    #[serde(rename = "blobRef", default, skip_serializing_if = "Option::is_none")]
    pub blob_ref: Option<BlobRef>,
}

/// Producing tool metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

/// The content manifest of one bundle version. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleIndex {
    pub version: String,
    /// ISO-8601 UTC creation timestamp
    pub created: String,
    pub tool: ToolInfo,
    /// Path → entry; the key always equals the entry's own path
    pub files: BTreeMap<BundlePath, FileEntry>,
    /// Free-form metadata; optional and forward-compatible
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl BundleIndex {
    /// Build an index from entries, stamping the current time and tool
    /// version.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the entries violate an index invariant.
    pub fn new(entries: impl IntoIterator<Item = FileEntry>) -> Result<Self> {
        let files = entries
            .into_iter()
            .map(|e| (e.path.clone(), e))
            .collect::<BTreeMap<_, _>>();

        let index = Self {
            version: INDEX_VERSION.to_string(),
            created: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            tool: ToolInfo {
                name: TOOL_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            files,
            metadata: BTreeMap::new(),
        };
        index.validate()?;
        Ok(index)
    }

    /// Parse and validate an index from its serialized bytes.
    ///
    /// # Errors
    /// Returns `InvalidInput` for malformed JSON or invariant violations.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::InvalidInput(format!("malformed bundle index: {e}")))?;
        index.validate()?;
        Ok(index)
    }

    /// Check the index invariants: map key equals entry path, and a blob
    /// reference is present exactly when storage is `Blob`.
    ///
    /// # Errors
    /// Returns `InvalidInput` naming the offending entry.
    pub fn validate(&self) -> Result<()> {
        for (key, entry) in &self.files {
            if key != &entry.path {
                return Err(BundleError::InvalidInput(format!(
                    "index key {key} does not match entry path {}",
                    entry.path
                )));
            }
            match (entry.storage, entry.blob_ref.is_some()) {
                (StorageKind::Blob, false) => {
                    return Err(BundleError::InvalidInput(format!(
                        "{key}: blob storage requires blobRef"
                    )));
                }
                (StorageKind::Oci, true) => {
                    return Err(BundleError::InvalidInput(format!(
                        "{key}: OCI storage must not carry blobRef"
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Canonical byte serialization: object keys sorted, no insignificant
    /// whitespace variation. Serializing the same logical index twice yields
    /// byte-identical output.
    ///
    /// # Errors
    /// Returns `InvalidInput` if serialization fails (it cannot for a
    /// validated index).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        // Round-tripping through Value sorts every object's keys, since
        // serde_json's default map is ordered.
        let value = serde_json::to_value(self)
            .map_err(|e| BundleError::InvalidInput(format!("cannot serialize index: {e}")))?;
        serde_json::to_vec_pretty(&value)
            .map_err(|e| BundleError::InvalidInput(format!("cannot serialize index: {e}")))
    }

    /// Digest of the canonical bytes; this is what the OCI manifest's config
    /// descriptor references.
    ///
    /// # Errors
    /// Propagates serialization failure.
    pub fn digest(&self) -> Result<Digest> {
        Ok(Digest::of_bytes(&self.canonical_bytes()?))
    }

    /// Path → digest view for diffing and sync-state updates.
    #[must_use]
    pub fn file_digests(&self) -> BTreeMap<BundlePath, Digest> {
        self.files
            .iter()
            .map(|(p, e)| (p.clone(), e.digest))
            .collect()
    }

    /// Total content size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|e| e.size).sum()
    }
}
