//! Embedded shard backed by redb.
//!
//! `LocalConnector` serves `file:///path/to/shard.redb` and `mem://name`
//! URLs. Every connection to the same URL shares one database, so several
//! registries in one process see the same shard. All mutations of one
//! request, including trigger side effects, commit in a single write
//! transaction.

use crate::admin::{AdminStatement, TriggerAction, TriggerDef};
use crate::client::{
    BucketSchema, FindOptions, PutObjectOutcome, RequestOptions, SortOrder, StoreClient,
    StoreConnector, StoredObject, Transport, TransportEvent, WriteOptions,
};
use crate::filter::Filter;
use crate::tables;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use shardmeta_common::{StoreError, StoreResult, now_ms, value_etag};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::mpsc;
use tracing::{debug, error};
use url::Url;

/// Error type for embedded shard operations
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::TransactionError> for LocalError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<LocalError> for StoreError {
    fn from(e: LocalError) -> Self {
        match e {
            LocalError::Store(inner) => inner,
            LocalError::Json(inner) => Self::Serialization(inner.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

type LocalResult<T> = Result<T, LocalError>;

/// Row layout of every bucket table
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    value: Value,
    etag: String,
    mtime: u64,
}

impl Row {
    fn into_object(self, bucket: &str, key: &str) -> StoredObject {
        StoredObject {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: self.value,
            etag: self.etag,
            mtime: self.mtime,
        }
    }
}

/// A redb database holding the buckets of one shard
pub struct ShardDb {
    db: Database,
}

impl ShardDb {
    /// Open (or create) an on-disk shard.
    pub fn open(path: impl AsRef<Path>) -> LocalResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Database::create(path)?)
    }

    /// Create an empty in-memory shard.
    pub fn in_memory() -> LocalResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> LocalResult<Self> {
        // Create the system tables eagerly so read txns never miss them
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::CATALOG)?;
            let _t = write_txn.open_table(tables::TRIGGERS)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    // ---- Buckets ----

    pub fn put_bucket(&self, name: &str, schema: &BucketSchema) -> LocalResult<()> {
        if name.is_empty() || schema.index.keys().any(String::is_empty) {
            return Err(StoreError::InvalidBucketSchema {
                bucket: name.to_string(),
                reason: "bucket and index names must be non-empty".to_string(),
            }
            .into());
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut catalog = write_txn.open_table(tables::CATALOG)?;
            let current: Option<BucketSchema> = match catalog.get(name)? {
                Some(bytes) => Some(serde_json::from_slice(bytes.value())?),
                None => None,
            };
            match current {
                Some(cur) if cur.version > schema.version => {
                    return Err(StoreError::BucketVersionConflict {
                        bucket: name.to_string(),
                        current: cur.version,
                        requested: schema.version,
                    }
                    .into());
                }
                Some(cur) if cur.version == schema.version => {
                    debug!(bucket = name, version = cur.version, "bucket up to date");
                }
                _ => {
                    let bytes = serde_json::to_vec(schema)?;
                    catalog.insert(name, bytes.as_slice())?;
                    let table_name = tables::bucket_table_name(name);
                    let _t = write_txn.open_table(bucket_table(&table_name))?;
                    debug!(bucket = name, version = schema.version, "bucket created or upgraded");
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get_bucket(&self, name: &str) -> LocalResult<BucketSchema> {
        let read_txn = self.db.begin_read()?;
        let catalog = read_txn.open_table(tables::CATALOG)?;
        let schema = catalog
            .get(name)?
            .ok_or_else(|| StoreError::BucketNotFound(name.to_string()))?;
        Ok(serde_json::from_slice(schema.value())?)
    }

    // ---- Objects ----

    pub fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        expected_etag: Option<&str>,
    ) -> LocalResult<PutObjectOutcome> {
        let write_txn = self.db.begin_write()?;
        let schema = load_schema(&write_txn, bucket)?;
        let table_name = tables::bucket_table_name(bucket);
        let (etag, previous) = {
            let mut table = write_txn.open_table(bucket_table(&table_name))?;
            let previous = match table.get(key)? {
                Some(bytes) => Some(serde_json::from_slice::<Row>(bytes.value())?),
                None => None,
            };
            check_etag(bucket, key, expected_etag, previous.as_ref())?;

            for attr in schema.unique_attributes() {
                let Some(wanted) = value.get(attr).filter(|v| !v.is_null()) else {
                    continue;
                };
                for entry in table.iter()? {
                    let (k, bytes) = entry?;
                    if k.value() == key {
                        continue;
                    }
                    let row: Row = serde_json::from_slice(bytes.value())?;
                    if row.value.get(attr) == Some(wanted) {
                        return Err(StoreError::UniqueAttribute {
                            bucket: bucket.to_string(),
                            attribute: attr.to_string(),
                            value: wanted.to_string(),
                        }
                        .into());
                    }
                }
            }

            let row = Row {
                value: value.clone(),
                etag: value_etag(value),
                mtime: now_ms(),
            };
            let bytes = serde_json::to_vec(&row)?;
            table.insert(key, bytes.as_slice())?;
            (row.etag, previous)
        };

        if previous.is_none() {
            run_triggers(&write_txn, bucket, value, 1)?;
        }
        write_txn.commit()?;

        Ok(PutObjectOutcome {
            etag,
            previous: previous.map(|row| row.into_object(bucket, key)),
        })
    }

    pub fn get_object(&self, bucket: &str, key: &str) -> LocalResult<StoredObject> {
        let read_txn = self.db.begin_read()?;
        let catalog = read_txn.open_table(tables::CATALOG)?;
        if catalog.get(bucket)?.is_none() {
            return Err(StoreError::BucketNotFound(bucket.to_string()).into());
        }
        let table_name = tables::bucket_table_name(bucket);
        let table = read_txn.open_table(bucket_table(&table_name))?;
        let bytes = table.get(key)?.ok_or_else(|| StoreError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        let row: Row = serde_json::from_slice(bytes.value())?;
        Ok(row.into_object(bucket, key))
    }

    pub fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        expected_etag: Option<&str>,
    ) -> LocalResult<StoredObject> {
        let write_txn = self.db.begin_write()?;
        load_schema(&write_txn, bucket)?;
        let table_name = tables::bucket_table_name(bucket);
        let previous = {
            let mut table = write_txn.open_table(bucket_table(&table_name))?;
            let previous = match table.get(key)? {
                Some(bytes) => serde_json::from_slice::<Row>(bytes.value())?,
                None => {
                    return Err(StoreError::ObjectNotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                    .into());
                }
            };
            check_etag(bucket, key, expected_etag, Some(&previous))?;
            table.remove(key)?;
            previous
        };
        run_triggers(&write_txn, bucket, &previous.value, -1)?;
        write_txn.commit()?;
        Ok(previous.into_object(bucket, key))
    }

    pub fn find_objects(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOptions,
    ) -> LocalResult<Vec<StoredObject>> {
        let read_txn = self.db.begin_read()?;
        let catalog = read_txn.open_table(tables::CATALOG)?;
        if catalog.get(bucket)?.is_none() {
            return Err(StoreError::BucketNotFound(bucket.to_string()).into());
        }
        let table_name = tables::bucket_table_name(bucket);
        let table = read_txn.open_table(bucket_table(&table_name))?;

        let mut matched = Vec::new();
        for entry in table.iter()? {
            let (k, bytes) = entry?;
            let key = k.value();
            let row: Row = serde_json::from_slice(bytes.value())?;
            if filter.matches(key, &row.value) {
                matched.push(row.into_object(bucket, key));
            }
        }

        if let Some(sort) = &opts.sort {
            matched.sort_by(|a, b| {
                let ord = compare_attr(a, b, &sort.attribute);
                match sort.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }

        Ok(matched
            .into_iter()
            .skip(opts.offset)
            .take(opts.limit.unwrap_or(usize::MAX))
            .collect())
    }

    // ---- Administration ----

    pub fn apply(&self, statements: &[AdminStatement]) -> LocalResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut triggers = write_txn.open_table(tables::TRIGGERS)?;
            for stmt in statements {
                match stmt {
                    AdminStatement::DropTrigger { name, bucket } => {
                        triggers.remove(tables::trigger_key(bucket, name).as_str())?;
                    }
                    AdminStatement::CreateTrigger(def) => {
                        load_schema(&write_txn, &def.bucket)?;
                        let bytes = serde_json::to_vec(def)?;
                        triggers.insert(
                            tables::trigger_key(&def.bucket, &def.name).as_str(),
                            bytes.as_slice(),
                        )?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

fn bucket_table(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

fn load_schema(txn: &WriteTransaction, bucket: &str) -> LocalResult<BucketSchema> {
    let catalog = txn.open_table(tables::CATALOG)?;
    let bytes = catalog
        .get(bucket)?
        .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
    Ok(serde_json::from_slice(bytes.value())?)
}

fn check_etag(
    bucket: &str,
    key: &str,
    expected: Option<&str>,
    current: Option<&Row>,
) -> Result<(), StoreError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match current {
        Some(row) if row.etag == expected => Ok(()),
        _ => Err(StoreError::EtagConflict {
            bucket: bucket.to_string(),
            key: key.to_string(),
            expected: expected.to_string(),
            actual: current.map_or_else(|| "null".to_string(), |r| r.etag.clone()),
        }),
    }
}

/// Apply the triggers of `bucket` for a created (`delta = 1`) or deleted
/// (`delta = -1`) value.
fn run_triggers(txn: &WriteTransaction, bucket: &str, value: &Value, delta: i64) -> LocalResult<()> {
    let defs: Vec<TriggerDef> = {
        let triggers = txn.open_table(tables::TRIGGERS)?;
        let mut defs = Vec::new();
        for entry in triggers.iter()? {
            let (_, bytes) = entry?;
            let def: TriggerDef = serde_json::from_slice(bytes.value())?;
            if def.bucket == bucket {
                defs.push(def);
            }
        }
        defs
    };

    for def in defs {
        match &def.action {
            TriggerAction::CountDirname { into } => {
                let Some(dir) = value.get("dirname").and_then(Value::as_str) else {
                    continue;
                };
                let table_name = tables::bucket_table_name(into);
                let mut table = txn.open_table(bucket_table(&table_name))?;
                let current = match table.get(dir)? {
                    Some(bytes) => serde_json::from_slice::<Row>(bytes.value())?
                        .value
                        .get("entries")
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                    None => 0,
                };
                let entries = (current + delta).max(0);
                let value = json!({ "entries": entries });
                let row = Row {
                    etag: value_etag(&value),
                    value,
                    mtime: now_ms(),
                };
                let bytes = serde_json::to_vec(&row)?;
                table.insert(dir, bytes.as_slice())?;
            }
        }
    }
    Ok(())
}

fn compare_attr(a: &StoredObject, b: &StoredObject, attr: &str) -> Ordering {
    match attr {
        "_key" => a.key.cmp(&b.key),
        "_mtime" => a.mtime.cmp(&b.mtime),
        _ => match (a.value.get(attr), b.value.get(attr)) {
            (Some(Value::Number(x)), Some(Value::Number(y))) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
            (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        },
    }
}

/// Client for an embedded shard
pub struct LocalShard {
    url: String,
    db: Arc<ShardDb>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl LocalShard {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            Err(StoreError::ConnectionClosed {
                url: self.url.clone(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreClient for LocalShard {
    fn url(&self) -> &str {
        &self.url
    }

    async fn put_bucket(&self, name: &str, schema: &BucketSchema) -> StoreResult<()> {
        self.check_open()?;
        Ok(self.db.put_bucket(name, schema)?)
    }

    async fn get_bucket(&self, name: &str) -> StoreResult<BucketSchema> {
        self.check_open()?;
        Ok(self.db.get_bucket(name)?)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        opts: &WriteOptions,
    ) -> StoreResult<PutObjectOutcome> {
        self.check_open()?;
        debug!(shard = %self.url, bucket, key, request_id = %opts.request_id, "put_object");
        Ok(self.db.put_object(bucket, key, value, opts.etag.as_deref())?)
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &RequestOptions,
    ) -> StoreResult<StoredObject> {
        self.check_open()?;
        debug!(shard = %self.url, bucket, key, request_id = %opts.request_id, "get_object");
        Ok(self.db.get_object(bucket, key)?)
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &WriteOptions,
    ) -> StoreResult<StoredObject> {
        self.check_open()?;
        debug!(shard = %self.url, bucket, key, request_id = %opts.request_id, "delete_object");
        Ok(self.db.delete_object(bucket, key, opts.etag.as_deref())?)
    }

    fn find_objects(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOptions,
    ) -> BoxStream<'static, StoreResult<StoredObject>> {
        let result = self.check_open().and_then(|()| {
            self.db
                .find_objects(bucket, filter, opts)
                .map_err(StoreError::from)
        });
        match result {
            Ok(rows) => stream::iter(rows.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn sql(&self, statement: &str, opts: &RequestOptions) -> StoreResult<Vec<Value>> {
        self.check_open()?;
        debug!(shard = %self.url, request_id = %opts.request_id, sql = statement, "sql");
        let statements = AdminStatement::parse_script(statement)?;
        self.db.apply(&statements)?;
        Ok(Vec::new())
    }

    async fn ping(&self, _opts: &RequestOptions) -> StoreResult<()> {
        self.check_open()
    }

    async fn close(&self) {
        if !self.closed.swap(true, AtomicOrdering::AcqRel) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }
}

/// Connector for embedded shards
#[derive(Default)]
pub struct LocalConnector {
    dbs: Mutex<HashMap<String, Arc<ShardDb>>>,
}

impl LocalConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Database behind `url`, opened on first use
    pub fn database(&self, url: &str) -> StoreResult<Arc<ShardDb>> {
        let mut dbs = self.dbs.lock();
        if let Some(db) = dbs.get(url) {
            return Ok(Arc::clone(db));
        }

        let connect_failed = |reason: String| StoreError::ConnectFailed {
            url: url.to_string(),
            reason,
        };
        let parsed = Url::parse(url).map_err(|e| connect_failed(e.to_string()))?;
        let db = match parsed.scheme() {
            "mem" => ShardDb::in_memory(),
            "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|()| connect_failed("invalid file path".to_string()))?;
                ShardDb::open(path)
            }
            other => return Err(connect_failed(format!("unsupported scheme {other}"))),
        }
        .map_err(|e| {
            error!("Failed to open shard database '{}': {}", url, e);
            connect_failed(e.to_string())
        })?;

        let db = Arc::new(db);
        dbs.insert(url.to_string(), Arc::clone(&db));
        Ok(db)
    }
}

#[async_trait]
impl StoreConnector for LocalConnector {
    async fn connect(&self, url: &str) -> StoreResult<Transport> {
        let db = self.database(url)?;
        let (tx, rx) = mpsc::unbounded_channel();
        debug!(shard = url, "local shard connected");
        Ok(Transport {
            client: Arc::new(LocalShard {
                url: url.to_string(),
                db,
                events: tx,
                closed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}
