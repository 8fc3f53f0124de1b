//! OCI image manifest for bundle artifacts
//!
//! One manifest per bundle version: the config descriptor references the
//! canonical BundleIndex bytes, and each OCI-stored file becomes one layer.
//! The `org.opencontainers.image.title` annotation carries the full
//! project-relative path, never the basename; basenames collide
//! (`src/model.py` vs `lib/model.py`) and basename-only titles lose data on
//! pull.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::{BundleError, Result};
use crate::index::BundleIndex;
use crate::path::BundlePath;
use crate::policy::StorageKind;

/// Media type of the manifest document itself
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of the config blob (the BundleIndex)
pub const INDEX_MEDIA_TYPE: &str = "application/vnd.modelops.bundle.index.v1+json";

/// Media type of file layers
pub const LAYER_MEDIA_TYPE: &str = "application/octet-stream";

/// Annotation key holding the full project-relative path of a layer
pub const TITLE_ANNOTATION: &str = "org.opencontainers.image.title";

/// Annotation key holding the manifest creation time
pub const CREATED_ANNOTATION: &str = "org.opencontainers.image.created";

/// A content descriptor: media type, digest, size, optional annotations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// OCI image manifest, schema version 2
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl OciManifest {
    /// Build the manifest for an index whose canonical bytes are
    /// `index_bytes`. Layers are emitted in path order, one per OCI-stored
    /// file, each titled with its full path.
    #[must_use]
    pub fn for_index(index: &BundleIndex, index_bytes: &[u8]) -> Self {
        let layers = index
            .files
            .values()
            .filter(|entry| entry.storage == StorageKind::Oci)
            .map(|entry| Descriptor {
                media_type: LAYER_MEDIA_TYPE.to_string(),
                digest: entry.digest,
                size: entry.size,
                annotations: Some(BTreeMap::from([(
                    TITLE_ANNOTATION.to_string(),
                    entry.path.as_str().to_string(),
                )])),
            })
            .collect();

        Self {
            schema_version: 2,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: INDEX_MEDIA_TYPE.to_string(),
                digest: Digest::of_bytes(index_bytes),
                size: index_bytes.len() as u64,
                annotations: None,
            },
            layers,
            annotations: Some(BTreeMap::from([(
                CREATED_ANNOTATION.to_string(),
                index.created.clone(),
            )])),
        }
    }

    /// Serialize to the bytes that will be pushed. The registry's own digest
    /// of these exact bytes identifies the manifest; we never re-serialize a
    /// fetched manifest to recompute it.
    ///
    /// # Errors
    /// Returns `InvalidInput` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| BundleError::InvalidInput(format!("cannot serialize manifest: {e}")))
    }

    /// Parse a manifest fetched from a registry.
    ///
    /// # Errors
    /// Returns `InvalidInput` for malformed JSON or a non-bundle config
    /// media type.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| BundleError::InvalidInput(format!("malformed manifest: {e}")))?;
        if manifest.config.media_type != INDEX_MEDIA_TYPE {
            return Err(BundleError::InvalidInput(format!(
                "artifact config is {}, not a bundle index; \
                 this artifact was not produced by {}",
                manifest.config.media_type,
                crate::index::TOOL_NAME
            )));
        }
        Ok(manifest)
    }

    /// The full path recorded in a layer's title annotation.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the annotation is missing or malformed.
    pub fn layer_path(layer: &Descriptor) -> Result<BundlePath> {
        let title = layer
            .annotations
            .as_ref()
            .and_then(|a| a.get(TITLE_ANNOTATION))
            .ok_or_else(|| {
                BundleError::InvalidInput(format!(
                    "layer {} has no {TITLE_ANNOTATION} annotation",
                    layer.digest.short()
                ))
            })?;
        BundlePath::parse(title.clone())
    }
}
