//! Content digests: SHA-256 in canonical `sha256:<hex>` form
//!
//! Digests identify file contents, config blobs, and manifests. The string
//! form is validated strictly before use because digests are spliced into
//! cache paths and blob URIs.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::error::{BundleError, Result};

/// Read buffer for streaming file hashes
const HASH_BUF_SIZE: usize = 64 * 1024;

/// A SHA-256 content digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Parse the canonical string form `sha256:` + 64 lowercase hex chars.
    ///
    /// # Errors
    /// Returns `InvalidInput` for any other shape, including uppercase hex.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("sha256:")
            .ok_or_else(|| BundleError::InvalidInput(format!("digest missing sha256: prefix: {s:?}")))?;

        if hex_part.len() != 64 || !hex_part.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(BundleError::InvalidInput(format!(
                "digest must be 64 lowercase hex chars: {s:?}"
            )));
        }

        let mut raw = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut raw)
            .map_err(|e| BundleError::InvalidInput(format!("bad digest hex: {e}")))?;
        Ok(Self(raw))
    }

    /// Hash a byte slice.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Hash a file by streaming its contents.
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be opened or read. A file that
    /// disappears mid-hash surfaces as an ordinary I/O error, which callers
    /// may retry.
    pub fn of_file(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; HASH_BUF_SIZE];

        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Self(hasher.finalize().into()))
    }

    /// The 64-char lowercase hex part, without the `sha256:` prefix.
    #[must_use]
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First two hex characters; shard level one of cache and blob layouts.
    #[must_use]
    pub fn shard1(&self) -> String {
        self.hex()[..2].to_string()
    }

    /// Hex characters three and four; shard level two.
    #[must_use]
    pub fn shard2(&self) -> String {
        self.hex()[2..4].to_string()
    }

    /// Abbreviated form for log lines and error messages.
    #[must_use]
    pub fn short(&self) -> String {
        self.hex()[..12].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest(sha256:{}...)", self.short())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(D::Error::custom)
    }
}
