//! shardmeta Placement - consistent hashing of namespace directories
//!
//! Entries are placed by their effective directory so that every entry of a
//! directory lives on the same shard. The ring uses virtual nodes so that
//! adding a shard only moves roughly `1/(N+1)` of the directories.
//!
//! # Example
//! ```ignore
//! use shardmeta_placement::HashRouter;
//!
//! let router = HashRouter::new(HashAlgorithm::Sha256, 100);
//! router.add_shard("tcp://a:2020/", conn_a);
//! let conn = router.resolve("/acct/stor/dir/file")?;
//! ```

pub mod ring;
pub mod router;

pub use ring::{HashRing, RingTopology, ring_position};
pub use router::HashRouter;
