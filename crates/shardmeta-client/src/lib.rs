//! shardmeta Client - one logical metadata store over many shards
//!
//! [`ShardRegistry`] is the entry point: it keeps a self-healing
//! [`ShardConnection`] per shard, places ready shards on a consistent hash
//! ring and routes every metadata verb to the shard owning the key's
//! directory.

pub mod backoff;
pub mod connection;
pub mod delete_log;
pub mod events;
pub mod metadata;
pub mod provision;
pub mod registry;

// Re-exports
pub use backoff::Backoff;
pub use connection::{ConnectionEvent, ConnectionState, ShardConnection};
pub use delete_log::{DeleteLogEntry, DeleteQueue};
pub use events::RegistryEvent;
pub use metadata::{
    DeleteOptions, GetOptions, MetadataStore, PutOptions, SearchOptions, StoredMetadata,
};
pub use registry::ShardRegistry;
