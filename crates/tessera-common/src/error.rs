//! Error types for Tessera
//!
//! One workspace-wide error enum, grouped by kind: corruption, missing,
//! unavailable, conflict, capacity, and config. External handlers map the
//! kinds onto HTTP statuses via [`Error::http_status_code`].

use std::path::PathBuf;
use thiserror::Error;

/// Common result type for Tessera operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the Tessera target core
#[derive(Debug, Error)]
pub enum Error {
    // corruption: caller must refuse to serve the object
    #[error("size mismatch for {}: meta {} != stat {}", .fqn.display(), .meta, .fs)]
    SizeMismatch { fqn: PathBuf, meta: i64, fs: i64 },

    #[error("checksum mismatch for {}: stored {}, computed {}", .fqn.display(), .stored, .computed)]
    BadChecksum {
        fqn: PathBuf,
        stored: String,
        computed: String,
    },

    #[error("corrupted metadata record for {}: {}", .fqn.display(), .reason)]
    BadMeta { fqn: PathBuf, reason: String },

    #[error("non-numeric object version {0:?}")]
    NonNumericVersion(String),

    // missing: callers may treat as not-existing
    #[error("object not found: {}", .0.display())]
    ObjectNotFound(PathBuf),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("no metadata attached: {}", .0.display())]
    NoMetadata(PathBuf),

    // unavailable: mountpath I/O error, escalated to FSHC
    #[error("mountpath I/O error at {}: {}", .fqn.display(), .source)]
    Unavailable {
        fqn: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // conflict: programmer error, asserted in debug builds, logged otherwise
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{} is a copy", .0.display())]
    SourceIsCopy(PathBuf),

    // capacity
    #[error("out of space: {pct_max}% used on the worst mountpath")]
    OutOfSpace { pct_max: i32 },

    #[error("capacity exceeded: {pct_max}% used, watermark {wm}%")]
    CapacityExceeded { pct_max: i32, wm: i64 },

    // config: rejected at registration/init
    #[error("invalid FQN: {}", .0.display())]
    InvalidFqn(PathBuf),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an I/O error observed under a mountpath
    pub fn unavailable(fqn: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Unavailable {
            fqn: fqn.into(),
            source,
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Check if this is a not found error (file, xattr record, or bucket)
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound(_) | Self::BucketNotFound(_) | Self::NoMetadata(_)
        )
    }

    /// Corruption errors refuse to serve the object
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::SizeMismatch { .. } | Self::BadChecksum { .. } | Self::BadMeta { .. }
        )
    }

    /// Capacity errors surface as node-state flags and a typed error on ingest
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. } | Self::CapacityExceeded { .. })
    }

    /// HTTP status an external handler would answer with
    #[must_use]
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::ObjectNotFound(_) | Self::BucketNotFound(_) | Self::NoMetadata(_) => 404,

            Self::Conflict(_) | Self::SourceIsCopy(_) => 409,

            Self::OutOfSpace { .. } | Self::CapacityExceeded { .. } => 507,

            Self::InvalidFqn(_) | Self::Config(_) => 400,

            Self::SizeMismatch { .. }
            | Self::BadChecksum { .. }
            | Self::BadMeta { .. }
            | Self::NonNumericVersion(_)
            | Self::Unavailable { .. } => 500,
        }
    }
}
