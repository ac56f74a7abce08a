//! Connection to a single shard
//!
//! Each [`ShardConnection`] owns one background task that connects to the
//! shard, provisions its buckets and trigger, then watches the transport
//! until it fails or the connection is closed. Failed attempts and
//! reconnects after a transport failure wait out a randomized exponential
//! backoff, retried forever; only `close()` stops the task. The failure
//! count is forgotten only once a connection has stayed ready for the
//! longest backoff delay. The store client is handed out only while the state is `Ready`.

use crate::backoff::{Backoff, log_attempt_failure};
use crate::metadata::{
    DeleteOptions, GetOptions, MetadataStore, PutOptions, SearchOptions, StoredMetadata,
};
use crate::provision::provision;
use futures::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use shardmeta_common::{
    BucketNames, ConnectionConfig, Error, MetadataRecord, NewMetadata, Result, StoreError,
};
use shardmeta_meta_store::{StoreClient, StoreConnector, Transport, TransportEvent};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a shard connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Waiting out a backoff delay
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Creating buckets and installing triggers
    Provisioning,
    /// Serving requests
    Ready,
    /// The transport failed after being ready; reconnecting
    Degraded,
    /// Closed for good
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification sent to the owner of a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Provisioned and serving requests
    Ready,
    /// Steady-state transport error; the connection is reconnecting
    Error(StoreError),
    /// The background task has exited
    Closed,
}

enum Command {
    Close,
}

struct Shared {
    url: String,
    config: ConnectionConfig,
    buckets: Arc<BucketNames>,
    connector: Arc<dyn StoreConnector>,
    state: watch::Sender<ConnectionState>,
    client: RwLock<Option<Arc<dyn StoreClient>>>,
    closing: AtomicBool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(shard = %self.url, from = %previous, to = %state, "connection state changed");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // The owner may have gone away already
        let _ = self.events.send(event);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// One connect-and-provision attempt.
    async fn init_attempt(&self) -> Result<Transport> {
        let timeout = self.config.connect_timeout();
        let transport_err = |source: StoreError| Error::Transport {
            shard: self.url.clone(),
            source,
        };

        let mut transport = match tokio::time::timeout(timeout, self.connector.connect(&self.url))
            .await
        {
            Ok(connected) => connected.map_err(transport_err)?,
            Err(_) => {
                return Err(transport_err(StoreError::ConnectTimeout {
                    url: self.url.clone(),
                    timeout_ms: self.config.connect_timeout_ms,
                }));
            }
        };

        // An error raised while connecting fails the attempt
        if let Ok(event) = transport.events.try_recv() {
            transport.client.close().await;
            return Err(transport_err(self.event_error(Some(event))));
        }

        if !self.config.read_only {
            self.set_state(ConnectionState::Provisioning);
            let request_id = uuid::Uuid::new_v4().to_string();
            let provisioned = tokio::select! {
                result = provision(transport.client.as_ref(), &self.buckets, &request_id) => {
                    result.map_err(|source| Error::Provisioning {
                        shard: self.url.clone(),
                        source,
                    })
                }
                event = transport.events.recv() => Err(transport_err(self.event_error(event))),
            };
            if let Err(e) = provisioned {
                transport.client.close().await;
                return Err(e);
            }
        }

        Ok(transport)
    }

    fn event_error(&self, event: Option<TransportEvent>) -> StoreError {
        match event {
            Some(TransportEvent::Error(e)) => e,
            Some(TransportEvent::Closed) | None => StoreError::ConnectionClosed {
                url: self.url.clone(),
            },
        }
    }

    /// Drop the live client after a steady-state failure.
    fn degrade(&self, error: Option<StoreError>) {
        *self.client.write() = None;
        self.set_state(ConnectionState::Degraded);
        match error {
            Some(e) if !self.is_closing() => {
                warn!(shard = %self.url, error = %e, "shard transport error, reconnecting");
                self.emit(ConnectionEvent::Error(e));
            }
            Some(e) => debug!(shard = %self.url, error = %e, "transport error while closing"),
            None => warn!(shard = %self.url, "shard transport closed, reconnecting"),
        }
    }
}

/// Background task driving one connection.
async fn run(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut backoff = Backoff::new(shared.config.backoff.clone());

    loop {
        shared.set_state(ConnectionState::Connecting);
        let attempt = tokio::select! {
            biased;
            _ = commands.recv() => break,
            result = shared.init_attempt() => result,
        };

        match attempt {
            Ok(mut transport) => {
                let ready_at = Instant::now();
                let client = Arc::clone(&transport.client);
                *shared.client.write() = Some(Arc::clone(&client));
                shared.set_state(ConnectionState::Ready);
                info!(shard = %shared.url, read_only = shared.config.read_only, "shard ready");
                shared.emit(ConnectionEvent::Ready);

                let stop = tokio::select! {
                    biased;
                    _ = commands.recv() => true,
                    event = transport.events.recv() => {
                        match event {
                            Some(TransportEvent::Error(e)) => shared.degrade(Some(e)),
                            Some(TransportEvent::Closed) | None => shared.degrade(None),
                        }
                        false
                    }
                };

                *shared.client.write() = None;
                client.close().await;
                if stop {
                    while let Ok(TransportEvent::Error(e)) = transport.events.try_recv() {
                        debug!(shard = %shared.url, error = %e, "transport error while closing");
                    }
                    break;
                }

                // A connection that flaps keeps its failure count
                if ready_at.elapsed() >= backoff.max_delay() {
                    backoff.reset();
                }
                let delay = backoff.next_delay();
                debug!(
                    shard = %shared.url,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reconnecting after backoff"
                );
                tokio::select! {
                    biased;
                    _ = commands.recv() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                log_attempt_failure(&shared.url, backoff.failures(), delay, &e);
                shared.set_state(ConnectionState::Disconnected);
                tokio::select! {
                    biased;
                    _ = commands.recv() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    *shared.client.write() = None;
    shared.set_state(ConnectionState::Closed);
    info!(shard = %shared.url, "shard connection closed");
    shared.emit(ConnectionEvent::Closed);
}

/// A self-healing connection to one shard
pub struct ShardConnection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ShardConnection {
    /// Start connecting to `url` in the background.
    ///
    /// Must be called from within a tokio runtime. The returned receiver
    /// carries [`ConnectionEvent`]s for the owner.
    pub fn spawn(
        url: &str,
        config: ConnectionConfig,
        buckets: Arc<BucketNames>,
        connector: Arc<dyn StoreConnector>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            url: url.to_string(),
            config,
            buckets,
            connector,
            state,
            client: RwLock::new(None),
            closing: AtomicBool::new(false),
            events: events_tx,
        });
        let task = tokio::spawn(run(Arc::clone(&shared), commands_rx));

        let conn = Arc::new(Self {
            shared,
            commands: commands_tx,
            task: Mutex::new(Some(task)),
        });
        (conn, events_rx)
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.shared.config.read_only
    }

    /// Wait until the connection is ready; fails if it closes first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.shared.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
            .await
            .map_err(|_| Error::Closed)?;
        if state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Metadata verbs bound to the live store client.
    ///
    /// Fails with `NotConnected` unless the connection is ready.
    pub fn store(&self) -> Result<MetadataStore> {
        let client = self.shared.client.read().clone();
        client
            .map(|client| {
                MetadataStore::new(
                    client,
                    Arc::clone(&self.shared.buckets),
                    self.shared.config.read_only,
                )
            })
            .ok_or_else(|| Error::NotConnected {
                shard: self.shared.url.clone(),
            })
    }

    pub async fn put_metadata(
        &self,
        entry: NewMetadata,
        opts: &PutOptions,
    ) -> Result<StoredMetadata> {
        self.store()?.put_metadata(entry, opts).await
    }

    pub async fn get_metadata(&self, key: &str, opts: &GetOptions) -> Result<StoredMetadata> {
        self.store()?.get_metadata(key, opts).await
    }

    pub async fn del_metadata(&self, key: &str, opts: &DeleteOptions) -> Result<()> {
        self.store()?.del_metadata(key, opts).await
    }

    pub async fn get_directory_count(&self, dir: &str, opts: &GetOptions) -> Result<u64> {
        self.store()?.get_directory_count(dir, opts).await
    }

    pub fn search(
        &self,
        filter: &str,
        opts: &SearchOptions,
    ) -> Result<BoxStream<'static, Result<MetadataRecord>>> {
        self.store()?.search(filter, opts)
    }

    pub async fn ping(&self) -> Result<()> {
        self.store()?.ping(None).await
    }

    /// Stop the background task and close the transport.
    ///
    /// Interrupts any pending connect attempt or backoff delay. Later calls
    /// return immediately.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Close);
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(shard = %self.shared.url, error = %e, "connection task failed");
        }
    }
}

impl fmt::Display for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ShardConnection<url={}, state={}>",
            self.shared.url,
            self.state()
        )
    }
}

impl fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConnection")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
