//! Error taxonomy shared by every public entry point.
//!
//! Transport-agnostic: the orchestrator and its collaborators return
//! [`EngineError`]; storage drivers return the narrower [`StorageError`],
//! which the orchestrator folds into [`EngineError`] at the call boundary.

use thiserror::Error;

/// Top-level error returned by the public API surface (§6 of the memory
/// engine contract: `Store`, `RetrieveContext`, `Consolidate`, ...).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input: empty content, content over the length cap, unknown role,
    /// too many tags. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced id does not exist. Deletes are tolerant of this (no-op);
    /// reads surface it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The underlying storage timed out or refused the connection. Retried
    /// by the resilient wrapper; surfaced only once fallback also fails.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The requested capability (e.g. vector search) is not provided by the
    /// active driver. The orchestrator treats this as a partial read and
    /// continues with the remaining tiers.
    #[error("capability missing: {0}")]
    CapabilityMissing(String),

    /// A consolidation cycle was rolled back. The API surfaces this with a
    /// retry-after hint; ordinary reads/writes are unaffected.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An invariant was violated unexpectedly. No state mutation occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias for fallible public-API operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Error returned by a storage-driver repository method.
///
/// Narrower than [`EngineError`]: drivers know nothing about validation or
/// conflict semantics, only about their own backing store.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("capability not supported by this driver: {0}")]
    CapabilityMissing(String),
}

/// Convenience alias for fallible storage-driver operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => EngineError::NotFound(msg),
            StorageError::CapabilityMissing(msg) => EngineError::CapabilityMissing(msg),
            StorageError::Timeout(d) => {
                EngineError::Unavailable(format!("operation timed out after {d:?}"))
            }
            StorageError::Backend(msg) => EngineError::Unavailable(msg),
            StorageError::Io(err) => EngineError::Unavailable(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => StorageError::NotFound(err.to_string()),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_maps_to_engine_not_found() {
        let err: EngineError = StorageError::NotFound("fact-123".into()).into();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn storage_capability_missing_maps_through() {
        let err: EngineError =
            StorageError::CapabilityMissing("vector search".into()).into();
        assert!(matches!(err, EngineError::CapabilityMissing(_)));
    }

    #[test]
    fn storage_timeout_maps_to_unavailable() {
        let err: EngineError =
            StorageError::Timeout(std::time::Duration::from_secs(30)).into();
        assert!(matches!(err, EngineError::Unavailable(_)));
    }
}
