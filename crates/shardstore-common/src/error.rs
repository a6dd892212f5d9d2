//! Error types for Shardstore
//!
//! One taxonomy for the whole system: every surface (REST handlers, the
//! pipeline, the CLI) maps these kinds onto status codes or exit codes
//! instead of inventing its own.

use crate::types::{BucketNameError, ObjectKeyError, TierParseError};
use thiserror::Error;

/// Common result type for Shardstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Shardstore
#[derive(Debug, Error)]
pub enum Error {
    // Request validation
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid bucket name: {0}")]
    InvalidBucketName(#[from] BucketNameError),

    #[error("invalid object key: {0}")]
    InvalidObjectKey(#[from] ObjectKeyError),

    #[error("invalid tier: {0}")]
    InvalidTier(#[from] TierParseError),

    // Consensus routing
    #[error("not the leader{}", leader.as_deref().map(|l| format!(" (leader: {l})")).unwrap_or_default())]
    NotLeader { leader: Option<String> },

    #[error("apply timed out; the command may still commit")]
    ApplyTimeout,

    // Catalog rejections
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("object already exists: {bucket}/{key}")]
    ObjectAlreadyExists { bucket: String, key: String },

    #[error("state conflict: {0}")]
    StateConflict(String),

    // Data plane
    #[error("insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    #[error("shard not found: {0}")]
    ShardNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    // External collaborators
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    // Internal
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a state conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an upstream-unavailable error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(msg.into())
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotLeader { .. } | Self::ApplyTimeout | Self::UpstreamUnavailable(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BucketNotFound(_)
                | Self::ObjectNotFound { .. }
                | Self::ShardNotFound(_)
                | Self::NotFound(_)
        )
    }

    /// Get the HTTP status code this kind surfaces as
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidBucketName(_)
            | Self::InvalidObjectKey(_)
            | Self::InvalidTier(_) => 400,

            Self::AuthFailure(_) => 403,

            Self::BucketNotFound(_)
            | Self::ObjectNotFound { .. }
            | Self::ShardNotFound(_)
            | Self::NotFound(_) => 404,

            Self::BucketAlreadyExists(_)
            | Self::ObjectAlreadyExists { .. }
            | Self::StateConflict(_) => 409,

            // A follower with a known leader answers with a redirect;
            // leaderless clusters surface 503 at the handler.
            Self::NotLeader { leader: Some(_) } => 307,
            Self::NotLeader { leader: None } => 503,

            Self::UpstreamUnavailable(_) | Self::InsufficientShards { .. } => 503,

            Self::ApplyTimeout => 504,

            Self::IntegrityFailure(_)
            | Self::IoFailure(_)
            | Self::Serialization(_)
            | Self::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(Error::ApplyTimeout.is_retryable());
        assert!(Error::NotLeader { leader: None }.is_retryable());
        assert!(!Error::StateConflict("exists".into()).is_retryable());
    }

    #[test]
    fn test_error_http_status() {
        assert_eq!(Error::InvalidRequest("bad".into()).http_status(), 400);
        assert_eq!(Error::BucketNotFound("b1".into()).http_status(), 404);
        assert_eq!(
            Error::ObjectAlreadyExists {
                bucket: "b".into(),
                key: "k".into()
            }
            .http_status(),
            409
        );
        assert_eq!(
            Error::NotLeader {
                leader: Some("http://n2:7400".into())
            }
            .http_status(),
            307
        );
        assert_eq!(Error::NotLeader { leader: None }.http_status(), 503);
        assert_eq!(Error::ApplyTimeout.http_status(), 504);
        assert_eq!(
            Error::InsufficientShards {
                available: 5,
                required: 6
            }
            .http_status(),
            503
        );
    }
}
