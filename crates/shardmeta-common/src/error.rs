//! Error types for shardmeta
//!
//! Two closed sets live here. [`StoreError`] is what a single key-value
//! store shard can report; [`Error`] is what callers of the sharded
//! metadata client observe. Callers match on variants, never on messages.

use thiserror::Error;

/// Result type for store-level operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Common result type for shardmeta client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a key-value store shard
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    // Transport errors
    #[error("connect to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },

    #[error("connect to {url} timed out after {timeout_ms} ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("connection to {url} is closed")]
    ConnectionClosed { url: String },

    #[error("transport error on {url}: {reason}")]
    Transport { url: String, reason: String },

    // Data errors
    #[error("{bucket}::{key} does not exist")]
    ObjectNotFound { bucket: String, key: String },

    #[error("bucket {0} does not exist")]
    BucketNotFound(String),

    #[error("{bucket}::{key} has etag {actual}, expected {expected}")]
    EtagConflict {
        bucket: String,
        key: String,
        expected: String,
        actual: String,
    },

    #[error("{bucket}: unique attribute {attribute}={value} already in use")]
    UniqueAttribute {
        bucket: String,
        attribute: String,
        value: String,
    },

    #[error("bucket {bucket} has version {current}, newer than {requested}")]
    BucketVersionConflict {
        bucket: String,
        current: u32,
        requested: u32,
    },

    #[error("invalid bucket schema for {bucket}: {reason}")]
    InvalidBucketSchema { bucket: String, reason: String },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    // Backend errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Create a storage error
    pub fn storage(msg: impl ToString) -> Self {
        Self::Storage(msg.to_string())
    }

    /// Check if this is an optimistic-concurrency conflict
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::EtagConflict { .. } | Self::UniqueAttribute { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound { .. } | Self::BucketNotFound(_))
    }

    /// Check if this error came from the transport rather than the data
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailed { .. }
                | Self::ConnectTimeout { .. }
                | Self::ConnectionClosed { .. }
                | Self::Transport { .. }
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Errors surfaced by the sharded metadata client
#[derive(Clone, Debug, Error)]
pub enum Error {
    // Connection errors
    #[error("not connected to shard {shard}")]
    NotConnected { shard: String },

    #[error("no shards are registered in the hash ring")]
    NoShards,

    #[error("provisioning {shard} failed: {source}")]
    Provisioning { shard: String, source: StoreError },

    #[error("transport error on {shard}: {source}")]
    Transport { shard: String, source: StoreError },

    #[error("shard registry is closed")]
    Closed,

    // Metadata errors
    #[error("conflict writing {key}: {source}")]
    Conflict { key: String, source: StoreError },

    #[error("{key} does not exist")]
    NotFound { key: String },

    #[error("shard {shard} is read-only")]
    ReadOnly { shard: String },

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("invalid shard url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Create an invalid metadata error
    pub fn invalid_metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }

    /// Classify a store error raised while operating on `key` of `shard`.
    #[must_use]
    pub fn from_store(shard: &str, key: &str, err: StoreError) -> Self {
        if err.is_conflict() {
            Self::Conflict {
                key: key.to_string(),
                source: err,
            }
        } else if err.is_not_found() {
            Self::NotFound {
                key: key.to_string(),
            }
        } else if err.is_transport() {
            Self::Transport {
                shard: shard.to_string(),
                source: err,
            }
        } else {
            Self::Store(err)
        }
    }

    /// Check if the caller may reasonably retry the same request later
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected { .. } | Self::Transport { .. })
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this is a compare-and-swap conflict
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn etag_conflict() -> StoreError {
        StoreError::EtagConflict {
            bucket: "b".into(),
            key: "/k".into(),
            expected: "a".into(),
            actual: "b".into(),
        }
    }

    #[test]
    fn test_store_error_classes() {
        assert!(etag_conflict().is_conflict());
        assert!(
            StoreError::UniqueAttribute {
                bucket: "b".into(),
                attribute: "objectId".into(),
                value: "x".into(),
            }
            .is_conflict()
        );
        assert!(StoreError::BucketNotFound("b".into()).is_not_found());
        assert!(
            StoreError::ConnectTimeout {
                url: "tcp://a".into(),
                timeout_ms: 10
            }
            .is_transport()
        );
        assert!(!StoreError::storage("boom").is_conflict());
    }

    #[test]
    fn test_from_store_classification() {
        let err = Error::from_store("tcp://a", "/k", etag_conflict());
        assert!(err.is_conflict());

        let err = Error::from_store(
            "tcp://a",
            "/k",
            StoreError::ObjectNotFound {
                bucket: "b".into(),
                key: "/k".into(),
            },
        );
        assert!(err.is_not_found());

        let err = Error::from_store(
            "tcp://a",
            "/k",
            StoreError::ConnectionClosed {
                url: "tcp://a".into(),
            },
        );
        assert!(err.is_retryable());

        let err = Error::from_store("tcp://a", "/k", StoreError::storage("disk"));
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn test_error_retryable() {
        assert!(
            Error::NotConnected {
                shard: "tcp://a".into()
            }
            .is_retryable()
        );
        assert!(!Error::NoShards.is_retryable());
        assert!(!Error::NotFound { key: "/k".into() }.is_retryable());
    }
}
