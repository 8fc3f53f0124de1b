//! Error taxonomy for bundle operations
//!
//! Every failure mode maps to a stable exit code so shell callers can
//! distinguish "tag moved" from "pull blocked by local changes" without
//! parsing messages.

use std::io;

use thiserror::Error;

/// Errors surfaced by the bundle engine
#[derive(Debug, Error)]
pub enum BundleError {
    /// Malformed digest, illegal path, bad glob, unknown config key
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage/provider misconfiguration detected at plan time
    #[error("configuration error: {0}")]
    Config(String),

    /// Local filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transient registry or blob-store failure; safe to retry
    #[error("network error: {0}")]
    Network(String),

    /// Tag, manifest, or blob absent from the registry
    #[error("not found: {0}")]
    NotFound(String),

    /// Fetched content did not hash to its declared digest
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// The tag was re-pointed by a concurrent push
    #[error(
        "tag '{tag}' moved since last sync: expected {expected}, found {actual}; \
         pull to reconcile, then push again"
    )]
    TagMoved {
        tag: String,
        expected: String,
        actual: String,
    },

    /// Pull would overwrite or delete local state without `--overwrite`
    #[error("pull would overwrite or delete local changes: {0}; use --overwrite to force")]
    SafetyGuard(String),

    /// Another process holds the project lock
    #[error("another mobundle process is operating on this project")]
    ProjectBusy,

    /// Cancellation signal observed; no persistent state was mutated
    #[error("operation canceled")]
    Canceled,
}

impl BundleError {
    /// Process exit code for this error kind.
    ///
    /// 0 is success, 1 is reserved for unclassified failures (plain I/O).
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Io(_) | Self::ProjectBusy => 1,
            Self::InvalidInput(_) => 2,
            Self::Config(_) => 3,
            Self::Network(_) | Self::NotFound(_) => 4,
            Self::SafetyGuard(_) => 5,
            Self::TagMoved { .. } => 6,
            Self::DigestMismatch { .. } => 7,
            Self::Canceled => 8,
        }
    }

    /// Whether a retry with identical inputs can succeed.
    ///
    /// Only transient network failures qualify; `DigestMismatch` is an
    /// integrity event and must surface to the caller.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

pub type Result<T> = std::result::Result<T, BundleError>;
