//! The key-value store capability the metadata client is built on.
//!
//! A store exposes schema-indexed buckets of JSON values keyed by string,
//! with optimistic concurrency through per-value etags. A connector opens a
//! [`Transport`]: the client handle plus a stream of transport-level events
//! the connection owner must watch.

use crate::filter::Filter;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shardmeta_common::{StoreError, StoreResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type of an indexed attribute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    String,
    Number,
    Boolean,
}

/// One indexed attribute of a bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexField {
    #[serde(rename = "type")]
    pub index_type: IndexType,
    #[serde(default)]
    pub unique: bool,
}

/// Bucket schema: indexed attributes plus a version used for upgrades
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSchema {
    pub index: BTreeMap<String, IndexField>,
    pub version: u32,
}

impl BucketSchema {
    #[must_use]
    pub const fn new(version: u32) -> Self {
        Self {
            index: BTreeMap::new(),
            version,
        }
    }

    /// Add a non-unique index on `attr`
    #[must_use]
    pub fn index(mut self, attr: &str, index_type: IndexType) -> Self {
        self.index.insert(
            attr.to_string(),
            IndexField {
                index_type,
                unique: false,
            },
        );
        self
    }

    /// Add a unique index on `attr`
    #[must_use]
    pub fn unique(mut self, attr: &str, index_type: IndexType) -> Self {
        self.index.insert(
            attr.to_string(),
            IndexField {
                index_type,
                unique: true,
            },
        );
        self
    }

    /// Attributes that must be unique across the bucket
    pub fn unique_attributes(&self) -> impl Iterator<Item = &str> {
        self.index
            .iter()
            .filter(|(_, f)| f.unique)
            .map(|(name, _)| name.as_str())
    }
}

/// A value read back from a bucket
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub bucket: String,
    pub key: String,
    pub value: Value,
    pub etag: String,
    /// Milliseconds since the epoch
    pub mtime: u64,
}

/// Options carried by every request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub request_id: String,
}

/// Options for conditional writes and deletes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub request_id: String,
    /// Fail with an etag conflict unless the stored etag matches
    pub etag: Option<String>,
}

/// Result of a successful write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutObjectOutcome {
    pub etag: String,
    /// Value the write replaced, if any
    pub previous: Option<StoredObject>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Ordering of search results
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub attribute: String,
    #[serde(default)]
    pub order: SortOrder,
}

/// Options for `find_objects`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FindOptions {
    pub request_id: String,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort: Option<Sort>,
}

/// Transport-level event raised outside of any request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Error(StoreError),
    Closed,
}

/// An open connection to one shard
pub struct Transport {
    pub client: Arc<dyn StoreClient>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Client for one key-value store shard
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// URL of the shard this client talks to
    fn url(&self) -> &str;

    /// Create a bucket, or upgrade it when `schema.version` is newer.
    async fn put_bucket(&self, name: &str, schema: &BucketSchema) -> StoreResult<()>;

    async fn get_bucket(&self, name: &str) -> StoreResult<BucketSchema>;

    /// Write `value` at `bucket::key`, honouring `opts.etag`.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        opts: &WriteOptions,
    ) -> StoreResult<PutObjectOutcome>;

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &RequestOptions,
    ) -> StoreResult<StoredObject>;

    /// Delete `bucket::key`, honouring `opts.etag`; returns the deleted value.
    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &WriteOptions,
    ) -> StoreResult<StoredObject>;

    /// Stream the values of `bucket` matching `filter`.
    fn find_objects(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOptions,
    ) -> BoxStream<'static, StoreResult<StoredObject>>;

    /// Administrative statement; returns result rows.
    async fn sql(&self, statement: &str, opts: &RequestOptions) -> StoreResult<Vec<Value>>;

    async fn ping(&self, opts: &RequestOptions) -> StoreResult<()>;

    /// Close the transport. A `Closed` event follows.
    async fn close(&self);
}

/// Opens transports to shards by URL
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, url: &str) -> StoreResult<Transport>;
}
