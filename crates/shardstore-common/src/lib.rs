//! Shardstore common - shared types and utilities
//!
//! This crate holds the pieces every other Shardstore crate agrees on:
//! identifier newtypes, the error taxonomy, checksum helpers and the
//! atomic metric primitives the daemons render into Prometheus text.

pub mod checksum;
pub mod error;
pub mod metrics;
pub mod types;

pub use checksum::{Checksum, ChecksumCalculator, sha256_hex};
pub use error::{Error, Result};
pub use types::{
    BucketName, BucketNameError, ErasureParams, NodeId, ObjectKey, ObjectKeyError, ShardType, Tier,
    TierParseError,
};

use std::time::Duration;

/// Default timeout for any outbound HTTP call.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for a consensus apply as seen by the REST layer.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);
