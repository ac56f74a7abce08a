//! Shared helpers for shardmeta-client integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use shardmeta_client::{RegistryEvent, ShardRegistry};
use shardmeta_common::{
    BucketNames, ObjectFields, NewMetadata, RegistryConfig, Shark, StoreError, StoreResult,
};
use shardmeta_meta_store::{
    BucketSchema, Filter, FindOptions, LocalConnector, PutObjectOutcome, RequestOptions,
    ShardDb, StoreClient, StoreConnector, StoredObject, Transport, TransportEvent, WriteOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const ROOT: &str = "/ff2f9a80-bbda-11e1-afa7-0800200c9a66/stor";

/// Registry config with fast backoff
pub fn config(shards: &[String]) -> RegistryConfig {
    let mut config = RegistryConfig::default();
    config.shards = shards.to_vec();
    config.connection.connect_timeout_ms = 500;
    config.connection.backoff.initial_delay_ms = 5;
    config.connection.backoff.max_delay_ms = 20;
    config
}

/// Unique in-memory shard URLs for one test
pub fn mem_shards(test: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("mem://{test}-{i}/")).collect()
}

pub fn object(key: &str, object_id: &str) -> NewMetadata {
    NewMetadata::object(
        key,
        "owner-1",
        ObjectFields {
            content_length: 11,
            content_md5: "XrY7u+Ae7tCTyyK7j1rNww==".to_string(),
            content_type: "text/plain".to_string(),
            object_id: object_id.to_string(),
            etag: None,
            sharks: vec![
                Shark::new("1.stor.local").with_datacenter("dc1"),
                Shark::new("2.stor.local").with_datacenter("dc2"),
            ],
        },
    )
}

/// Wait for the first event matching `pred`, failing after five seconds
pub async fn next_event(
    events: &mut broadcast::Receiver<RegistryEvent>,
    pred: impl Fn(&RegistryEvent) -> bool,
) -> RegistryEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for registry event")
}

pub async fn ready_registry(
    shards: &[String],
    connector: Arc<dyn StoreConnector>,
) -> Arc<ShardRegistry> {
    let registry = ShardRegistry::connect(config(shards), connector).unwrap();
    tokio::time::timeout(Duration::from_secs(5), registry.wait_ready())
        .await
        .expect("registry never became ready")
        .unwrap();
    registry
}

#[derive(Default)]
struct Faults {
    connect_failures: u32,
    provision_failures: u32,
    conflicts: u32,
    /// Raise a transport error shortly after every successful connect
    flapping: bool,
    /// Raise a transport error from inside `close()`
    error_on_close: bool,
    /// Event senders of every transport handed out, newest last
    transports: Vec<(String, mpsc::UnboundedSender<TransportEvent>)>,
}

/// Connector over embedded shards that fails on command
#[derive(Default)]
pub struct FaultyConnector {
    inner: LocalConnector,
    faults: Arc<Mutex<Faults>>,
    pub connects: Arc<AtomicU32>,
    pub metadata_writes: Arc<AtomicU32>,
}

impl FaultyConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` connect calls
    pub fn fail_connects(&self, n: u32) {
        self.faults.lock().connect_failures = n;
    }

    /// Fail the next `n` bucket provisioning calls
    pub fn fail_provisioning(&self, n: u32) {
        self.faults.lock().provision_failures = n;
    }

    /// Report a uniqueness conflict for the next `n` metadata writes
    pub fn force_conflicts(&self, n: u32) {
        self.faults.lock().conflicts = n;
    }

    /// Break every transport shortly after it connects
    pub fn flap_transports(&self, on: bool) {
        self.faults.lock().flapping = on;
    }

    /// Make every client raise a transport error while it is being closed
    pub fn fail_on_close(&self, on: bool) {
        self.faults.lock().error_on_close = on;
    }

    /// Raise a transport error on the newest transport to `url`
    pub fn break_transport(&self, url: &str) {
        let faults = self.faults.lock();
        let sender = faults
            .transports
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .map(|(_, tx)| tx.clone())
            .expect("no transport for url");
        drop(faults);
        let _ = sender.send(TransportEvent::Error(StoreError::Transport {
            url: url.to_string(),
            reason: "connection reset by peer".to_string(),
        }));
    }

    /// Embedded database behind `url`, for inspecting side buckets
    pub fn database(&self, url: &str) -> Arc<ShardDb> {
        self.inner.database(url).unwrap()
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn metadata_write_count(&self) -> u32 {
        self.metadata_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreConnector for FaultyConnector {
    async fn connect(&self, url: &str) -> StoreResult<Transport> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock();
            if faults.connect_failures > 0 {
                faults.connect_failures -= 1;
                return Err(StoreError::ConnectFailed {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                });
            }
        }

        let Transport { client, mut events } = self.inner.connect(url).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if relay.send(event).is_err() {
                    break;
                }
            }
        });
        let flapping = {
            let mut faults = self.faults.lock();
            faults.transports.push((url.to_string(), tx.clone()));
            faults.flapping
        };
        if flapping {
            let url = url.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = tx.send(TransportEvent::Error(StoreError::Transport {
                    url,
                    reason: "connection reset by peer".to_string(),
                }));
            });
        }

        Ok(Transport {
            client: Arc::new(FaultyClient {
                inner: client,
                faults: Arc::clone(&self.faults),
                metadata_writes: Arc::clone(&self.metadata_writes),
                metadata_bucket: BucketNames::default().metadata,
                events: tx,
            }),
            events: rx,
        })
    }
}

struct FaultyClient {
    inner: Arc<dyn StoreClient>,
    faults: Arc<Mutex<Faults>>,
    metadata_writes: Arc<AtomicU32>,
    metadata_bucket: String,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl FaultyClient {
    fn forced_conflict(&self, bucket: &str, key: &str) -> StoreResult<()> {
        if bucket != self.metadata_bucket {
            return Ok(());
        }
        self.metadata_writes.fetch_add(1, Ordering::SeqCst);
        let mut faults = self.faults.lock();
        if faults.conflicts > 0 {
            faults.conflicts -= 1;
            return Err(StoreError::UniqueAttribute {
                bucket: bucket.to_string(),
                attribute: "objectId".to_string(),
                value: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreClient for FaultyClient {
    fn url(&self) -> &str {
        self.inner.url()
    }

    async fn put_bucket(&self, name: &str, schema: &BucketSchema) -> StoreResult<()> {
        {
            let mut faults = self.faults.lock();
            if faults.provision_failures > 0 {
                faults.provision_failures -= 1;
                return Err(StoreError::storage("tuple concurrently updated"));
            }
        }
        self.inner.put_bucket(name, schema).await
    }

    async fn get_bucket(&self, name: &str) -> StoreResult<BucketSchema> {
        self.inner.get_bucket(name).await
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        opts: &WriteOptions,
    ) -> StoreResult<PutObjectOutcome> {
        self.forced_conflict(bucket, key)?;
        self.inner.put_object(bucket, key, value, opts).await
    }

    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &RequestOptions,
    ) -> StoreResult<StoredObject> {
        self.inner.get_object(bucket, key, opts).await
    }

    async fn delete_object(
        &self,
        bucket: &str,
        key: &str,
        opts: &WriteOptions,
    ) -> StoreResult<StoredObject> {
        self.forced_conflict(bucket, key)?;
        self.inner.delete_object(bucket, key, opts).await
    }

    fn find_objects(
        &self,
        bucket: &str,
        filter: &Filter,
        opts: &FindOptions,
    ) -> BoxStream<'static, StoreResult<StoredObject>> {
        self.inner.find_objects(bucket, filter, opts)
    }

    async fn sql(&self, statement: &str, opts: &RequestOptions) -> StoreResult<Vec<Value>> {
        self.inner.sql(statement, opts).await
    }

    async fn ping(&self, opts: &RequestOptions) -> StoreResult<()> {
        self.inner.ping(opts).await
    }

    async fn close(&self) {
        let error_on_close = self.faults.lock().error_on_close;
        if error_on_close {
            let _ = self.events.send(TransportEvent::Error(StoreError::Transport {
                url: self.url().to_string(),
                reason: "broken pipe".to_string(),
            }));
        }
        self.inner.close().await;
    }
}
