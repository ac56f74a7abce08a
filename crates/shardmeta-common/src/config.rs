//! Configuration types for shardmeta
//!
//! Every struct here deserializes with `#[serde(default)]`, so a config file
//! only needs to name what differs from the defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Root configuration for a shard registry
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Shard URLs placed on the ring at startup
    pub shards: Vec<String>,
    /// Hash ring configuration
    pub hash: RingConfig,
    /// Per-shard connection configuration
    pub connection: ConnectionConfig,
    /// Names of the buckets provisioned on every shard
    pub buckets: BucketNames,
}

/// Hash function used to place virtual nodes and keys on the ring
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Xxh64,
}

impl HashAlgorithm {
    /// Canonical lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
            Self::Xxh64 => "xxh64",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "xxh64" | "xxhash64" => Ok(Self::Xxh64),
            other => Err(format!("unknown hash algorithm: {other}")),
        }
    }
}

/// Consistent hash ring configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Hash algorithm
    pub algorithm: HashAlgorithm,
    /// Virtual nodes per shard
    pub replicas: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            replicas: 100,
        }
    }
}

/// Connection configuration shared by every shard connection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Timeout for establishing the transport (milliseconds)
    pub connect_timeout_ms: u64,
    /// Skip bucket and trigger provisioning, refuse writes
    pub read_only: bool,
    /// Reconnect backoff policy
    pub backoff: BackoffConfig,
}

impl ConnectionConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            read_only: false,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Randomized exponential backoff between connection attempts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the second attempt (milliseconds)
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay (milliseconds)
    pub max_delay_ms: u64,
    /// Jitter factor in `[0, 1]`; a delay `d` becomes `d * (1 + r)` with
    /// `r` uniform in `[0, factor]`, capped at the maximum
    pub randomisation_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 300_000,
            randomisation_factor: 0.5,
        }
    }
}

/// Names of the buckets the client provisions on each shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketNames {
    /// Primary metadata bucket
    pub metadata: String,
    /// Durable delete log
    pub delete_log: String,
    /// Fast-delete queue, used when snaplinks are disabled
    pub fastdelete_queue: String,
    /// Directory entry counts, maintained by a trigger
    pub directory_counts: String,
}

impl Default for BucketNames {
    fn default() -> Self {
        Self {
            metadata: "shardmeta".to_string(),
            delete_log: "shardmeta_delete_log".to_string(),
            fastdelete_queue: "shardmeta_fastdelete_queue".to_string(),
            directory_counts: "shardmeta_directory_counts".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert!(config.shards.is_empty());
        assert_eq!(config.hash.algorithm, HashAlgorithm::Sha256);
        assert_eq!(config.hash.replicas, 100);
        assert_eq!(config.connection.connect_timeout(), Duration::from_secs(1));
        assert!(!config.connection.read_only);
        assert_eq!(config.connection.backoff.max_delay_ms, 300_000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RegistryConfig = serde_json::from_str(
            r#"{"shards":["tcp://a:2020"],"hash":{"algorithm":"sha1"},"connection":{"read_only":true}}"#,
        )
        .unwrap();
        assert_eq!(config.shards, vec!["tcp://a:2020"]);
        assert_eq!(config.hash.algorithm, HashAlgorithm::Sha1);
        assert_eq!(config.hash.replicas, 100);
        assert!(config.connection.read_only);
        assert_eq!(config.connection.connect_timeout_ms, 1000);
        assert_eq!(config.buckets, BucketNames::default());
    }

    #[test]
    fn test_hash_algorithm_parse() {
        assert_eq!("SHA256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        assert_eq!("xxhash64".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Xxh64));
        assert!("md5".parse::<HashAlgorithm>().is_err());
        assert_eq!(HashAlgorithm::Sha1.to_string(), "sha1");
    }
}
