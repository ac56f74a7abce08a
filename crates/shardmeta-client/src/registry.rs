//! Shard registry: the single logical metadata store
//!
//! The registry owns one [`ShardConnection`] per shard URL and a
//! [`HashRouter`] over the shards that have become ready. A shard joins the
//! ring the first time it reaches `Ready` and stays on it while degraded, so
//! keys never move because of a transient failure. CRUD calls are refused
//! with `NotConnected` until every initially configured shard is on the
//! ring.

use crate::connection::{ConnectionEvent, ShardConnection};
use crate::events::RegistryEvent;
use crate::metadata::{DeleteOptions, GetOptions, PutOptions, SearchOptions, StoredMetadata};
use futures::future::join_all;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use shardmeta_common::{
    BucketNames, Error, MetadataRecord, NewMetadata, RegistryConfig, Result, StoreError,
    sanitize_url,
};
use shardmeta_meta_store::StoreConnector;
use shardmeta_placement::{HashRouter, RingTopology};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Starting,
    Ready,
    Closed,
}

/// Routes metadata operations to the shard owning each key
pub struct ShardRegistry {
    config: RegistryConfig,
    buckets: Arc<BucketNames>,
    connector: Arc<dyn StoreConnector>,
    router: HashRouter<Arc<ShardConnection>>,
    connections: Mutex<BTreeMap<String, Arc<ShardConnection>>>,
    /// Sanitized URLs that must be on the ring before serving
    initial: BTreeSet<String>,
    events: broadcast::Sender<RegistryEvent>,
    phase: watch::Sender<Phase>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardRegistry {
    /// Start connecting to every configured shard.
    ///
    /// Returns immediately; use [`wait_ready`](Self::wait_ready) or
    /// [`subscribe`](Self::subscribe) to learn when the registry can serve.
    /// Must be called from within a tokio runtime.
    pub fn connect(config: RegistryConfig, connector: Arc<dyn StoreConnector>) -> Result<Arc<Self>> {
        let initial = config
            .shards
            .iter()
            .map(|url| sanitize_url(url))
            .collect::<Result<BTreeSet<_>>>()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (phase, _) = watch::channel(Phase::Starting);
        let registry = Arc::new(Self {
            buckets: Arc::new(config.buckets.clone()),
            router: HashRouter::new(config.hash.algorithm, config.hash.replicas),
            config,
            connector,
            connections: Mutex::new(BTreeMap::new()),
            initial,
            events,
            phase,
            tasks: Mutex::new(Vec::new()),
        });

        info!(
            shards = registry.initial.len(),
            algorithm = %registry.config.hash.algorithm,
            replicas = registry.config.hash.replicas,
            "starting shard registry"
        );
        for url in &registry.initial {
            registry.start_shard(url);
        }
        registry.check_ready();
        Ok(registry)
    }

    /// Add a shard at runtime. Adding a known URL returns the existing
    /// connection.
    pub fn add_shard(self: &Arc<Self>, url: &str) -> Result<Arc<ShardConnection>> {
        let url = sanitize_url(url)?;
        if self.phase() == Phase::Closed {
            return Err(Error::Closed);
        }
        Ok(self.start_shard(&url))
    }

    fn start_shard(self: &Arc<Self>, url: &str) -> Arc<ShardConnection> {
        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(url) {
            debug!(shard = url, "shard already registered");
            return Arc::clone(existing);
        }

        let (conn, events) = ShardConnection::spawn(
            url,
            self.config.connection.clone(),
            Arc::clone(&self.buckets),
            Arc::clone(&self.connector),
        );
        connections.insert(url.to_string(), Arc::clone(&conn));
        drop(connections);

        let task = tokio::spawn(forward_events(
            Arc::downgrade(self),
            Arc::clone(&conn),
            events,
        ));
        self.tasks.lock().push(task);
        conn
    }

    fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn on_shard_ready(&self, conn: &Arc<ShardConnection>) {
        if self.phase() == Phase::Closed {
            return;
        }
        let url = conn.url().to_string();
        info!(shard = %url, "shard connected");
        if self.router.add_shard(&url, Arc::clone(conn)) {
            let nodes = self.router.ring().nodes;
            info!(shard = %url, nodes = nodes.len(), "ring updated");
            self.emit(RegistryEvent::RingUpdated { nodes });
        }
        self.emit(RegistryEvent::ShardConnected { url });
        self.check_ready();
    }

    fn on_shard_error(&self, url: &str, error: StoreError) {
        if self.phase() == Phase::Closed {
            debug!(shard = url, error = %error, "suppressing shard error while closing");
            return;
        }
        self.emit(RegistryEvent::ShardError {
            url: url.to_string(),
            error,
        });
    }

    fn check_ready(&self) {
        if self.phase() != Phase::Starting {
            return;
        }
        if !self.initial.iter().all(|url| self.router.get(url).is_some()) {
            return;
        }
        let became_ready = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Starting {
                *phase = Phase::Ready;
                true
            } else {
                false
            }
        });
        if became_ready {
            info!(shards = self.router.len(), "shard registry ready");
            self.emit(RegistryEvent::Ready);
        }
    }

    fn pending_shards(&self) -> Vec<&str> {
        self.initial
            .iter()
            .filter(|url| self.router.get(url).is_none())
            .map(String::as_str)
            .collect()
    }

    fn check_serving(&self) -> Result<()> {
        match self.phase() {
            Phase::Ready => Ok(()),
            Phase::Closed => Err(Error::Closed),
            Phase::Starting => Err(Error::NotConnected {
                shard: self.pending_shards().join(","),
            }),
        }
    }

    /// Lifecycle events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Wait until every initial shard is on the ring.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.phase.subscribe();
        let phase = *rx
            .wait_for(|phase| *phase != Phase::Starting)
            .await
            .map_err(|_| Error::Closed)?;
        match phase {
            Phase::Ready => Ok(()),
            _ => Err(Error::Closed),
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }

    /// Connection owning `key`, routed by its effective directory
    pub fn client_for(&self, key: &str) -> Result<Arc<ShardConnection>> {
        self.check_serving()?;
        self.router.resolve(key)
    }

    /// Connection owning `hashable`, hashed as given
    pub fn client_for_raw(&self, hashable: &str) -> Result<Arc<ShardConnection>> {
        self.check_serving()?;
        self.router.resolve_raw(hashable)
    }

    /// Current ring topology
    #[must_use]
    pub fn ring(&self) -> RingTopology {
        self.router.ring()
    }

    /// Every registered connection, ready or not, ordered by URL
    #[must_use]
    pub fn shards(&self) -> Vec<Arc<ShardConnection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Connection owning `key`, or the one owning `dirname` when the record
    /// was placed by an explicit directory
    fn client_for_placed(&self, key: &str, dirname: Option<&str>) -> Result<Arc<ShardConnection>> {
        match dirname {
            Some(dir) => self.client_for_raw(dir),
            None => self.client_for(key),
        }
    }

    /// Write `entry` on the shard of the directory it is placed by.
    pub async fn put_metadata(
        &self,
        entry: NewMetadata,
        opts: &PutOptions,
    ) -> Result<StoredMetadata> {
        let conn = self.client_for_raw(entry.placement_dir())?;
        conn.put_metadata(entry, opts).await
    }

    pub async fn get_metadata(&self, key: &str, opts: &GetOptions) -> Result<StoredMetadata> {
        self.client_for_placed(key, opts.dirname.as_deref())?
            .get_metadata(key, opts)
            .await
    }

    pub async fn del_metadata(&self, key: &str, opts: &DeleteOptions) -> Result<()> {
        self.client_for_placed(key, opts.dirname.as_deref())?
            .del_metadata(key, opts)
            .await
    }

    /// Entries directly under `dir`; counted on the shard holding them
    pub async fn get_directory_count(&self, dir: &str, opts: &GetOptions) -> Result<u64> {
        self.client_for_raw(dir)?
            .get_directory_count(dir, opts)
            .await
    }

    /// Search the shard holding the entries of `dir`.
    pub fn search(
        &self,
        dir: &str,
        filter: &str,
        opts: &SearchOptions,
    ) -> Result<BoxStream<'static, Result<MetadataRecord>>> {
        self.client_for_raw(dir)?.search(filter, opts)
    }

    /// Ping the shard owning `key`
    pub async fn ping(&self, key: &str) -> Result<()> {
        self.client_for(key)?.ping().await
    }

    /// Close every connection and stop.
    ///
    /// Shard errors are no longer reported once this is called. `Closed`
    /// is emitted after every connection task has exited.
    pub async fn close(&self) {
        let previous = self.phase.send_replace(Phase::Closed);
        if previous == Phase::Closed {
            return;
        }
        info!("closing shard registry");

        let connections = self.shards();
        join_all(connections.iter().map(|conn| conn.close())).await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "shard event task failed");
            }
        }

        info!("shard registry closed");
        self.emit(RegistryEvent::Closed);
    }
}

/// Relay the events of one connection to its registry.
async fn forward_events(
    registry: Weak<ShardRegistry>,
    conn: Arc<ShardConnection>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        match event {
            ConnectionEvent::Ready => registry.on_shard_ready(&conn),
            ConnectionEvent::Error(error) => registry.on_shard_error(conn.url(), error),
            ConnectionEvent::Closed => break,
        }
    }
}

impl fmt::Display for ShardRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shards: Vec<String> = self.shards().iter().map(ToString::to_string).collect();
        write!(
            f,
            "ShardRegistry<ready={}, shards=[{}], ring={}>",
            self.is_ready(),
            shards.join(", "),
            self.router
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmeta_meta_store::LocalConnector;

    fn config(shards: &[&str]) -> RegistryConfig {
        let mut config = RegistryConfig::default();
        config.shards = shards.iter().map(ToString::to_string).collect();
        config.connection.backoff.initial_delay_ms = 10;
        config.connection.backoff.max_delay_ms = 50;
        config
    }

    #[tokio::test]
    async fn test_empty_registry_is_ready_without_shards() {
        let registry = ShardRegistry::connect(config(&[]), Arc::new(LocalConnector::new())).unwrap();
        registry.wait_ready().await.unwrap();
        assert!(matches!(registry.client_for("/a/b"), Err(Error::NoShards)));
        registry.close().await;
        assert!(matches!(registry.client_for("/a/b"), Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_shard_url() {
        let err = ShardRegistry::connect(config(&["not a url"]), Arc::new(LocalConnector::new()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_urls_share_a_connection() {
        let registry = ShardRegistry::connect(
            config(&["mem://dup", "mem://dup/"]),
            Arc::new(LocalConnector::new()),
        )
        .unwrap();
        assert_eq!(registry.shards().len(), 1);
        registry.wait_ready().await.unwrap();
        assert_eq!(registry.ring().nodes, vec!["mem://dup/".to_string()]);

        let again = registry.add_shard("mem://dup").unwrap();
        assert_eq!(again.url(), "mem://dup/");
        assert_eq!(registry.shards().len(), 1);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_shard_errors_suppressed_once_closed() {
        let registry = ShardRegistry::connect(config(&[]), Arc::new(LocalConnector::new())).unwrap();
        let mut events = registry.subscribe();
        let error = || StoreError::Transport {
            url: "mem://late/".to_string(),
            reason: "reset".to_string(),
        };

        registry.on_shard_error("mem://late/", error());
        assert!(matches!(
            events.try_recv(),
            Ok(RegistryEvent::ShardError { .. })
        ));

        registry.close().await;
        registry.on_shard_error("mem://late/", error());
        assert_eq!(events.try_recv().unwrap(), RegistryEvent::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_ready_fails_after_close() {
        let registry =
            ShardRegistry::connect(config(&["bogus://never/"]), Arc::new(LocalConnector::new()))
                .unwrap();
        assert!(matches!(
            registry.client_for("/a/b"),
            Err(Error::NotConnected { .. })
        ));
        registry.close().await;
        assert!(matches!(registry.wait_ready().await, Err(Error::Closed)));
        assert!(matches!(registry.add_shard("mem://late"), Err(Error::Closed)));
    }
}
