//! Project-relative POSIX paths
//!
//! Every path that is persisted (tracked list, sync state, bundle index) or
//! sent over the wire (layer annotations, blob keys) is a `BundlePath`:
//! forward slashes, relative, and free of `..` components. Conversion to the
//! platform form happens only at disk I/O time.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{BundleError, Result};

/// A validated project-relative path in POSIX form
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BundlePath(String);

impl BundlePath {
    /// Validate a POSIX-form string.
    ///
    /// # Errors
    /// Returns `InvalidInput` when the path is empty, absolute, contains
    /// `.`/`..` components, backslashes, NUL bytes, or empty segments.
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();

        if s.is_empty() {
            return Err(BundleError::InvalidInput("empty path".into()));
        }
        if s.contains('\0') {
            return Err(BundleError::InvalidInput("path contains NUL byte".into()));
        }
        if s.contains('\\') {
            return Err(BundleError::InvalidInput(format!(
                "path must use forward slashes: {s:?}"
            )));
        }
        if s.starts_with('/') {
            return Err(BundleError::InvalidInput(format!("absolute path: {s:?}")));
        }
        if s.ends_with('/') {
            return Err(BundleError::InvalidInput(format!(
                "path names a directory: {s:?}"
            )));
        }
        for part in s.split('/') {
            match part {
                "" => {
                    return Err(BundleError::InvalidInput(format!(
                        "path has empty segment: {s:?}"
                    )));
                }
                "." | ".." => {
                    return Err(BundleError::InvalidInput(format!(
                        "path traversal not allowed: {s:?}"
                    )));
                }
                _ => {}
            }
        }

        Ok(Self(s))
    }

    /// Convert a platform path (relative to the project root) to POSIX form.
    ///
    /// # Errors
    /// Returns `InvalidInput` for absolute paths, traversal, or non-UTF-8
    /// components.
    pub fn from_relative(path: &Path) -> Result<Self> {
        let mut parts = Vec::new();
        for comp in path.components() {
            match comp {
                Component::Normal(os) => {
                    let part = os.to_str().ok_or_else(|| {
                        BundleError::InvalidInput(format!("non-UTF-8 path: {}", path.display()))
                    })?;
                    parts.push(part);
                }
                Component::CurDir => {}
                _ => {
                    return Err(BundleError::InvalidInput(format!(
                        "path must be project-relative: {}",
                        path.display()
                    )));
                }
            }
        }
        Self::parse(parts.join("/"))
    }

    /// The POSIX string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against a project root, producing a platform path.
    #[must_use]
    pub fn to_native(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for part in self.0.split('/') {
            out.push(part);
        }
        out
    }
}

impl fmt::Display for BundlePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BundlePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BundlePath({:?})", self.0)
    }
}

impl Serialize for BundlePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BundlePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_nested_paths() {
        let p = BundlePath::parse("src/model.py").unwrap();
        assert_eq!(p.as_str(), "src/model.py");
        assert!(BundlePath::parse("a").is_ok());
        assert!(BundlePath::parse("data/raw/x.csv").is_ok());
    }

    #[test]
    fn test_parse_rejects_unsafe_paths() {
        assert!(BundlePath::parse("").is_err());
        assert!(BundlePath::parse("/etc/passwd").is_err());
        assert!(BundlePath::parse("../secret").is_err());
        assert!(BundlePath::parse("a/../b").is_err());
        assert!(BundlePath::parse("a/./b").is_err());
        assert!(BundlePath::parse("a//b").is_err());
        assert!(BundlePath::parse("a\\b").is_err());
        assert!(BundlePath::parse("dir/").is_err());
        assert!(BundlePath::parse("a\0b").is_err());
    }

    #[test]
    fn test_from_relative() {
        let p = BundlePath::from_relative(Path::new("src").join("model.py").as_path()).unwrap();
        assert_eq!(p.as_str(), "src/model.py");

        assert!(BundlePath::from_relative(Path::new("../up")).is_err());
    }

    #[test]
    fn test_to_native_roundtrip() {
        let root = Path::new("/project");
        let p = BundlePath::parse("data/x.csv").unwrap();
        let native = p.to_native(root);
        assert_eq!(native, root.join("data").join("x.csv"));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut v = vec![
            BundlePath::parse("b.txt").unwrap(),
            BundlePath::parse("a/z.txt").unwrap(),
            BundlePath::parse("a.txt").unwrap(),
        ];
        v.sort();
        let strs: Vec<_> = v.iter().map(BundlePath::as_str).collect();
        assert_eq!(strs, vec!["a.txt", "a/z.txt", "b.txt"]);
    }
}
