//! Registry lifecycle events

use shardmeta_common::StoreError;

/// Event broadcast by a [`ShardRegistry`](crate::ShardRegistry)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// Every initially configured shard is connected and on the ring
    Ready,
    /// A shard finished provisioning and is serving requests
    ShardConnected { url: String },
    /// A ready shard hit a transport error and is reconnecting
    ShardError { url: String, error: StoreError },
    /// The ring topology changed; `nodes` is the new node list
    RingUpdated { nodes: Vec<String> },
    /// The registry has shut down
    Closed,
}
