//! Unified error types for dataio.
//!
//! Messages carry a stable upper-case code prefix so callers and logs can
//! group failures without matching on the full text.

use tokio_rusqlite::rusqlite;

/// Boxed error raised by an adapter implementation.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the persistence and caching engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The resolved adapter does not implement the requested capability.
    #[error("CAPABILITY_MISMATCH: adapter '{source_name}' does not support {capability}")]
    CapabilityMismatch { source_name: String, capability: &'static str },

    /// No adapter registered under the given name.
    #[error("ADAPTER_NOT_FOUND: {0}")]
    AdapterNotFound(String),

    /// An adapter is already registered under the given name.
    #[error("ADAPTER_EXISTS: {0}")]
    AdapterAlreadyRegistered(String),

    /// No payload file exists for the checksum.
    #[error("PAYLOAD_NOT_FOUND: {0}")]
    PayloadNotFound(String),

    /// No sidecar metadata exists for the checksum.
    #[error("METADATA_NOT_FOUND: {0}")]
    MetadataNotFound(String),

    /// ONLY_IF_CACHED lookup found nothing to serve.
    #[error("CACHE_MISS: hash={hash} bucket={bucket:?}")]
    CacheMiss { hash: String, bucket: Option<String> },

    /// Bytes on disk do not hash to the checksum they are stored under.
    #[error("CHECKSUM_MISMATCH: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Checksum is not a 64 character lowercase hex digest.
    #[error("INVALID_CHECKSUM: {0}")]
    InvalidChecksum(String),

    /// Operation attempted outside an open session.
    #[error("INVALID_STATE: {0}")]
    InvalidState(String),

    /// Error raised by an adapter's fetch/send/stream implementation.
    #[error(transparent)]
    Adapter(AdapterError),

    /// Database operation failed.
    #[error("STORE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("STORE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Filesystem operation failed.
    #[error("IO_ERROR: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("SERIALIZATION_ERROR: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input parameters.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Wrap an adapter failure without reinterpreting it.
    pub fn adapter(err: impl Into<AdapterError>) -> Self {
        Error::Adapter(err.into())
    }

    /// True for every member of the not-found family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::AdapterNotFound(_) | Error::PayloadNotFound(_) | Error::MetadataNotFound(_) | Error::CacheMiss { .. }
        )
    }

    /// True when stored bytes failed checksum verification.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::ChecksumMismatch { .. })
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}
