//! shardmeta Meta Store - the key-value store capability behind each shard
//!
//! This crate defines what the sharded metadata client needs from a store
//! shard ([`StoreClient`], [`StoreConnector`]) and provides an embedded,
//! redb-backed implementation ([`LocalConnector`]) for tests and local use.

pub mod admin;
pub mod client;
pub mod filter;
pub mod local;
pub mod tables;

// Re-exports
pub use admin::{AdminStatement, TriggerAction, TriggerDef};
pub use client::{
    BucketSchema, FindOptions, IndexField, IndexType, PutObjectOutcome, RequestOptions, Sort,
    SortOrder, StoreClient, StoreConnector, StoredObject, Transport, TransportEvent, WriteOptions,
};
pub use filter::Filter;
pub use local::{LocalConnector, LocalShard, ShardDb};
