//! Ignore rules for workspace scanning
//!
//! Gitignore-syntax rules evaluated against project-relative POSIX paths.
//! Built-in defaults cover VCS metadata, our own state directory, OS junk,
//! and editor autosaves. Rules from `.modelopsignore` and explicit extras are
//! layered after the defaults, so the evaluation order is: explicit includes
//! (`!pattern`) override explicit excludes override defaults. The one thing
//! no rule can re-include is the `.modelops-bundle/` directory itself.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{BundleError, Result};
use crate::path::BundlePath;
use crate::project::BUNDLE_DIR;

/// Patterns that are always excluded unless a later rule re-includes them
const DEFAULT_PATTERNS: &[&str] = &[
    // Version control
    ".git/",
    ".hg/",
    ".svn/",
    // Python
    "__pycache__/",
    "*.pyc",
    "*.pyo",
    ".ipynb_checkpoints/",
    ".venv/",
    "venv/",
    // Node
    "node_modules/",
    // IDE and editors
    ".idea/",
    ".vscode/",
    "*.swp",
    "*.swo",
    "*~",
    // OS junk
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
];

/// Name of the per-project ignore file
pub const IGNORE_FILE: &str = ".modelopsignore";

/// Compiled ignore rules for one project
#[derive(Debug)]
pub struct IgnoreMatcher {
    matcher: Gitignore,
}

impl IgnoreMatcher {
    /// Build the matcher for a project root.
    ///
    /// Loads `.modelopsignore` from the root if present, then appends
    /// `extra` rules (highest precedence).
    ///
    /// # Errors
    /// Returns `InvalidInput` if a pattern fails to compile.
    pub fn new(root: &Path, extra: &[String]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(root);

        for pattern in DEFAULT_PATTERNS {
            builder
                .add_line(None, pattern)
                .map_err(|e| BundleError::InvalidInput(format!("bad default pattern: {e}")))?;
        }

        let ignore_file = root.join(IGNORE_FILE);
        if ignore_file.exists() {
            // add() reports parse errors without aborting the build
            if let Some(e) = builder.add(&ignore_file) {
                return Err(BundleError::InvalidInput(format!(
                    "bad pattern in {IGNORE_FILE}: {e}"
                )));
            }
        }

        for pattern in extra {
            builder
                .add_line(None, pattern)
                .map_err(|e| BundleError::InvalidInput(format!("bad ignore pattern {pattern:?}: {e}")))?;
        }

        let matcher = builder
            .build()
            .map_err(|e| BundleError::InvalidInput(format!("cannot build ignore rules: {e}")))?;

        Ok(Self { matcher })
    }

    /// Whether a file path is excluded from scanning.
    #[must_use]
    pub fn is_ignored(&self, path: &BundlePath) -> bool {
        let rel = path.as_str();
        if Self::is_metadata(rel) {
            return true;
        }
        self.matcher
            .matched_path_or_any_parents(rel, false)
            .is_ignore()
    }

    /// Whether a directory should be descended into during scanning.
    ///
    /// Pruning is an optimization; gitignore semantics do not allow
    /// re-including files under an ignored directory, so skipping the subtree
    /// is sound.
    #[must_use]
    pub fn should_traverse(&self, rel_dir: &str) -> bool {
        if Self::is_metadata(rel_dir) {
            return false;
        }
        !self.matcher.matched(rel_dir, true).is_ignore()
    }

    fn is_metadata(rel: &str) -> bool {
        rel == BUNDLE_DIR || rel.starts_with(&format!("{BUNDLE_DIR}/"))
    }
}
