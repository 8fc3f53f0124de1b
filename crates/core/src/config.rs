//! Bundle configuration (.modelops-bundle/config.yaml)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::atomic::write_atomic;
use crate::cas::LinkMode;
use crate::error::{BundleError, Result};
use crate::policy::{BlobLocation, StorageMode, StoragePolicy, DEFAULT_THRESHOLD_BYTES};

/// Blob providers the configuration accepts
const KNOWN_PROVIDERS: &[&str] = &["azure", "s3", "gcs", "fs"];

/// Project configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    /// The bundle's home: `<host>/<repo>`, no tag or digest suffix
    pub registry_ref: String,

    /// Tag used when the user gives none
    #[serde(default = "default_tag")]
    pub default_tag: String,

    /// Storage placement settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Local CAS root; defaults to the user cache directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// How cached objects reach the working tree
    #[serde(default)]
    pub cache_link_mode: LinkMode,
}

/// The `storage:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSettings {
    #[serde(default)]
    pub mode: StorageMode,

    #[serde(default = "default_threshold")]
    pub threshold_bytes: u64,

    /// `""` means OCI-only; otherwise one of azure, s3, gcs, fs
    #[serde(default)]
    pub provider: String,

    /// Provider container / bucket (a directory for `fs`)
    #[serde(default)]
    pub container: String,

    /// Optional key prefix inside the container
    #[serde(default)]
    pub prefix: String,

    #[serde(default)]
    pub force_oci_patterns: Vec<String>,

    #[serde(default)]
    pub force_blob_patterns: Vec<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            mode: StorageMode::default(),
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            provider: String::new(),
            container: String::new(),
            prefix: String::new(),
            force_oci_patterns: Vec::new(),
            force_blob_patterns: Vec::new(),
        }
    }
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_threshold() -> u64 {
    DEFAULT_THRESHOLD_BYTES
}

impl StorageSettings {
    /// The configured blob destination, if a provider is set.
    #[must_use]
    pub fn blob_location(&self) -> Option<BlobLocation> {
        if self.provider.is_empty() {
            return None;
        }
        Some(BlobLocation {
            provider: self.provider.clone(),
            container: self.container.clone(),
            prefix: if self.prefix.is_empty() {
                None
            } else {
                Some(self.prefix.trim_end_matches('/').to_string())
            },
        })
    }
}

impl BundleConfig {
    /// A fresh configuration for `registry_ref` with all defaults.
    #[must_use]
    pub fn new(registry_ref: impl Into<String>) -> Self {
        Self {
            registry_ref: registry_ref.into(),
            default_tag: default_tag(),
            storage: StorageSettings::default(),
            cache_dir: None,
            cache_link_mode: LinkMode::default(),
        }
    }

    /// Load and validate from `config.yaml`.
    ///
    /// # Errors
    /// `NotFound` if the file is absent (the project is not initialized),
    /// `InvalidInput` for unknown keys or malformed YAML, `Config` for
    /// semantically invalid settings.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BundleError::NotFound(format!(
                "no bundle config at {}; run init first",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&text)
            .map_err(|e| BundleError::InvalidInput(format!("bad config.yaml: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Persist via atomic replace.
    ///
    /// # Errors
    /// Returns `Io` on write failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| BundleError::InvalidInput(format!("cannot serialize config: {e}")))?;
        write_atomic(path, text.as_bytes())
    }

    /// Validate settings that serde cannot check.
    ///
    /// # Errors
    /// Returns `Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.registry_ref.is_empty() {
            return Err(BundleError::Config("registry_ref is required".into()));
        }
        // Repository only: a tag or digest would defeat tag resolution
        let last = self.registry_ref.rsplit('/').next().unwrap_or("");
        if last.contains(':') || last.contains('@') {
            return Err(BundleError::Config(format!(
                "registry_ref must be a repository only (no :tag or @digest): {}",
                self.registry_ref
            )));
        }

        let provider = self.storage.provider.as_str();
        if !provider.is_empty() {
            if !KNOWN_PROVIDERS.contains(&provider) {
                return Err(BundleError::Config(format!(
                    "unknown storage.provider {provider:?}; expected one of {KNOWN_PROVIDERS:?}"
                )));
            }
            if self.storage.container.is_empty() {
                return Err(BundleError::Config(format!(
                    "storage.container is required for provider {provider:?}"
                )));
            }
        }
        Ok(())
    }

    /// Compile the placement policy.
    ///
    /// # Errors
    /// Propagates glob and provider errors.
    pub fn storage_policy(&self) -> Result<StoragePolicy> {
        StoragePolicy::new(
            self.storage.mode,
            self.storage.threshold_bytes,
            &self.storage.force_oci_patterns,
            &self.storage.force_blob_patterns,
            self.storage.blob_location(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml() {
        let config: BundleConfig =
            serde_yaml::from_str("registry_ref: localhost:5555/epi_model\n").unwrap();
        config.validate().unwrap();

        assert_eq!(config.default_tag, "latest");
        assert_eq!(config.storage.threshold_bytes, 52_428_800);
        assert_eq!(config.storage.mode, StorageMode::Auto);
        assert_eq!(config.cache_link_mode, LinkMode::Auto);
        assert!(config.storage.blob_location().is_none());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r"
registry_ref: ghcr.io/org/models
default_tag: main
storage:
  mode: auto
  threshold_bytes: 1048576
  provider: azure
  container: ml-artifacts
  prefix: models/
  force_oci_patterns: ['**/*.json']
  force_blob_patterns: ['data/**']
cache_dir: /tmp/bundle-cache
cache_link_mode: hardlink
";
        let config: BundleConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.cache_link_mode, LinkMode::Hardlink);
        let loc = config.storage.blob_location().unwrap();
        assert_eq!(loc.provider, "azure");
        assert_eq!(loc.prefix.as_deref(), Some("models"));
        config.storage_policy().unwrap();
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = serde_yaml::from_str::<BundleConfig>("registry_ref: x/y\ntypo_key: 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_registry_ref_must_be_repository_only() {
        for bad in ["localhost:5555/repo:latest", "host/repo@sha256:abc"] {
            let config = BundleConfig::new(bad);
            assert_eq!(config.validate().unwrap_err().exit_code(), 3, "{bad}");
        }
        // Ports in the host part are fine
        BundleConfig::new("localhost:5555/repo").validate().unwrap();
    }

    #[test]
    fn test_provider_validation() {
        let mut config = BundleConfig::new("host/repo");
        config.storage.provider = "dropbox".into();
        assert_eq!(config.validate().unwrap_err().exit_code(), 3);

        config.storage.provider = "fs".into();
        assert_eq!(config.validate().unwrap_err().exit_code(), 3); // missing container

        config.storage.container = "/tmp/blobs".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = BundleConfig::new("localhost:5555/p");
        config.storage.provider = "fs".into();
        config.storage.container = "/tmp/store".into();
        config.save(&path).unwrap();

        let loaded = BundleConfig::load(&path).unwrap();
        assert_eq!(loaded.registry_ref, "localhost:5555/p");
        assert_eq!(loaded.storage.provider, "fs");
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = BundleConfig::load(&dir.path().join("config.yaml")).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }
}
