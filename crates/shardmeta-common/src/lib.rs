//! shardmeta Common - Shared types and utilities
//!
//! This crate provides the metadata record model, namespace path rules,
//! error taxonomy and configuration structures used by every shardmeta
//! component.

pub mod checksum;
pub mod config;
pub mod error;
pub mod path;
pub mod types;

pub use checksum::{crc32c_hex, value_etag};
pub use config::{
    BackoffConfig, BucketNames, ConnectionConfig, HashAlgorithm, RegistryConfig, RingConfig,
};
pub use error::{Error, Result, StoreError, StoreResult};
pub use path::{basename, dirname, effective_dirname, is_namespace_root, sanitize_url};
pub use types::*;

/// Maximum number of attempts for a blind (non-CAS) write that keeps
/// hitting etag or uniqueness conflicts.
pub const MAX_CONFLICT_ATTEMPTS: u32 = 3;
