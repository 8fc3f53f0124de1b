//! Project context: the `.modelops-bundle/` directory
//!
//! Owns the on-disk layout (config.yaml, tracked, state.json) and the
//! project-level advisory lock that keeps concurrent invocations from
//! interleaving writes. Discovery walks upward from the working directory,
//! git-style.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::debug;

use crate::config::BundleConfig;
use crate::error::{BundleError, Result};
use crate::path::BundlePath;
use crate::state::SyncState;
use crate::tracked::TrackedSet;

/// Project metadata directory name
pub const BUNDLE_DIR: &str = ".modelops-bundle";

/// File names inside the metadata directory
pub const CONFIG_FILE: &str = "config.yaml";
pub const TRACKED_FILE: &str = "tracked";
pub const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "lock";

/// A project rooted at a directory containing `.modelops-bundle/`
#[derive(Debug, Clone)]
pub struct ProjectContext {
    root: PathBuf,
}

impl ProjectContext {
    /// Initialize a new project: create the metadata directory and write
    /// the config.
    ///
    /// # Errors
    /// `InvalidInput` if the directory is already a project; config
    /// validation errors propagate.
    pub fn init(root: &Path, config: &BundleConfig) -> Result<Self> {
        config.validate()?;
        let bundle_dir = root.join(BUNDLE_DIR);
        if bundle_dir.exists() {
            return Err(BundleError::InvalidInput(format!(
                "{} already exists",
                bundle_dir.display()
            )));
        }
        std::fs::create_dir_all(&bundle_dir)?;

        let ctx = Self {
            root: root.to_path_buf(),
        };
        config.save(&ctx.config_path())?;
        TrackedSet::new().save(&ctx.tracked_path())?;
        SyncState::default().save(&ctx.state_path())?;
        Ok(ctx)
    }

    /// Open an existing project at exactly `root`.
    ///
    /// # Errors
    /// `NotFound` if `root` has no metadata directory.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(BUNDLE_DIR).is_dir() {
            return Err(BundleError::NotFound(format!(
                "{} is not a bundle project",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Find the project containing `start` by walking up the tree.
    ///
    /// # Errors
    /// `NotFound` if no ancestor holds a metadata directory.
    pub fn discover(start: &Path) -> Result<Self> {
        let mut dir = start;
        loop {
            if dir.join(BUNDLE_DIR).is_dir() {
                debug!(root = %dir.display(), "found bundle project");
                return Self::open(dir);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => {
                    return Err(BundleError::NotFound(format!(
                        "no {BUNDLE_DIR} directory above {}",
                        start.display()
                    )));
                }
            }
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join(BUNDLE_DIR).join(CONFIG_FILE)
    }

    #[must_use]
    pub fn tracked_path(&self) -> PathBuf {
        self.root.join(BUNDLE_DIR).join(TRACKED_FILE)
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.root.join(BUNDLE_DIR).join(STATE_FILE)
    }

    /// Load the project configuration.
    ///
    /// # Errors
    /// See [`BundleConfig::load`].
    pub fn load_config(&self) -> Result<BundleConfig> {
        BundleConfig::load(&self.config_path())
    }

    /// Load the tracked set.
    ///
    /// # Errors
    /// See [`TrackedSet::load`].
    pub fn load_tracked(&self) -> Result<TrackedSet> {
        TrackedSet::load(&self.tracked_path())
    }

    /// Load the sync state.
    ///
    /// # Errors
    /// See [`SyncState::load`].
    pub fn load_state(&self) -> Result<SyncState> {
        SyncState::load(&self.state_path())
    }

    /// Convert a user-supplied path (absolute or relative to the current
    /// directory) into a project-relative bundle path.
    ///
    /// # Errors
    /// `InvalidInput` if the path lies outside the project root.
    pub fn to_bundle_path(&self, path: &Path) -> Result<BundlePath> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        let rel = absolute.strip_prefix(&self.root).map_err(|_| {
            BundleError::InvalidInput(format!(
                "{} is outside the project root {}",
                path.display(),
                self.root.display()
            ))
        })?;
        BundlePath::from_relative(rel)
    }

    /// Take the project lock, failing fast if another process holds it.
    ///
    /// # Errors
    /// `ProjectBusy` if the lock is held elsewhere.
    pub fn lock(&self) -> Result<ProjectLock> {
        let path = self.root.join(BUNDLE_DIR).join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(true) => Ok(ProjectLock { file }),
            Ok(false) => Err(BundleError::ProjectBusy),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held project lock; released on drop (and by the OS on crash)
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("failed to release project lock: {e}");
        }
    }
}
