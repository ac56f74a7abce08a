//! Routing of namespace keys to shard handles
//!
//! The router pairs a [`HashRing`] with the handle registered for every
//! node on it. Both live in one immutable snapshot that is swapped whole on
//! update, so a reader never sees a ring node without its handle.

use crate::ring::{HashRing, RingTopology};
use parking_lot::RwLock;
use shardmeta_common::{Error, HashAlgorithm, Result, effective_dirname};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Clone)]
struct Snapshot<T> {
    ring: HashRing,
    members: BTreeMap<String, T>,
}

/// Copy-on-write consistent hash router
pub struct HashRouter<T> {
    state: RwLock<Arc<Snapshot<T>>>,
}

impl<T: Clone> HashRouter<T> {
    /// Create an empty router
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, replicas: u32) -> Self {
        Self {
            state: RwLock::new(Arc::new(Snapshot {
                ring: HashRing::new(algorithm, replicas),
                members: BTreeMap::new(),
            })),
        }
    }

    fn snapshot(&self) -> Arc<Snapshot<T>> {
        Arc::clone(&self.state.read())
    }

    /// Place `url` on the ring, served by `handle`.
    ///
    /// Returns `false` and leaves the topology untouched if `url` is
    /// already present.
    pub fn add_shard(&self, url: &str, handle: T) -> bool {
        let mut guard = self.state.write();
        if guard.members.contains_key(url) {
            return false;
        }
        let mut next = Snapshot::clone(&guard);
        next.ring.add_node(url);
        next.members.insert(url.to_string(), handle);
        *guard = Arc::new(next);
        debug!(shard = url, nodes = guard.members.len(), "added shard to ring");
        true
    }

    /// Take `url` off the ring, returning its handle.
    pub fn remove_shard(&self, url: &str) -> Option<T> {
        let mut guard = self.state.write();
        if !guard.members.contains_key(url) {
            return None;
        }
        let mut next = Snapshot::clone(&guard);
        next.ring.remove_node(url);
        let handle = next.members.remove(url);
        *guard = Arc::new(next);
        debug!(shard = url, nodes = guard.members.len(), "removed shard from ring");
        handle
    }

    /// Shard URL and handle for `hashable`, taken as-is
    pub fn locate_raw(&self, hashable: &str) -> Result<(String, T)> {
        let snap = self.snapshot();
        let url = snap.ring.node_for(hashable).ok_or(Error::NoShards)?;
        let handle = snap.members.get(url).cloned().ok_or(Error::NoShards)?;
        trace!(key = hashable, shard = url, "resolved");
        Ok((url.to_string(), handle))
    }

    /// Shard URL and handle for the entry `key`
    pub fn locate(&self, key: &str) -> Result<(String, T)> {
        self.locate_raw(effective_dirname(key))
    }

    /// Handle for the entry `key`, placed by its effective directory
    pub fn resolve(&self, key: &str) -> Result<T> {
        self.locate(key).map(|(_, handle)| handle)
    }

    /// Handle for an arbitrary string, hashed exactly as given
    pub fn resolve_raw(&self, hashable: &str) -> Result<T> {
        self.locate_raw(hashable).map(|(_, handle)| handle)
    }

    /// Serialisable snapshot of the current topology
    #[must_use]
    pub fn ring(&self) -> RingTopology {
        self.snapshot().ring.topology()
    }

    /// Handle registered for `url`, if it is on the ring
    #[must_use]
    pub fn get(&self, url: &str) -> Option<T> {
        self.snapshot().members.get(url).cloned()
    }

    /// Every handle on the ring, ordered by URL
    #[must_use]
    pub fn shards(&self) -> Vec<(String, T)> {
        self.snapshot()
            .members
            .iter()
            .map(|(u, h)| (u.clone(), h.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> fmt::Display for HashRouter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = Arc::clone(&self.state.read());
        fmt::Display::fmt(&snap.ring, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const ROOT: &str = "/ff2f9a80-bbda-11e1-afa7-0800200c9a66/stor";

    fn router(n: usize) -> HashRouter<String> {
        let router = HashRouter::new(HashAlgorithm::Sha256, 100);
        for i in 0..n {
            let url = format!("tcp://{i}.moray.local:2020/");
            router.add_shard(&url, url.clone());
        }
        router
    }

    #[test]
    fn test_empty_router_is_an_error() {
        let router: HashRouter<String> = HashRouter::new(HashAlgorithm::Sha256, 10);
        assert!(matches!(router.resolve("/a/b"), Err(Error::NoShards)));
        assert!(!Error::NoShards.is_retryable());
    }

    #[test]
    fn test_siblings_share_a_shard() {
        let router = router(8);
        for d in 0..50 {
            let dir = format!("{ROOT}/dir-{d}");
            let first = router.resolve(&format!("{dir}/a")).unwrap();
            for leaf in ["b", "c.txt", "nested-name"] {
                assert_eq!(router.resolve(&format!("{dir}/{leaf}")).unwrap(), first);
            }
            assert_eq!(router.resolve_raw(&dir).unwrap(), first);
        }
    }

    #[test]
    fn test_root_hashes_to_itself() {
        let router = router(16);
        assert_eq!(
            router.resolve(ROOT).unwrap(),
            router.resolve_raw(ROOT).unwrap()
        );
        assert_eq!(
            router.resolve(&format!("{ROOT}/child")).unwrap(),
            router.resolve_raw(ROOT).unwrap()
        );
    }

    #[test]
    fn test_add_shard_bounded_remap() {
        let router = router(4);
        let dirs: Vec<String> = (0..2000)
            .map(|_| format!("/{}/stor/d", uuid::Uuid::new_v4()))
            .collect();
        let before: HashMap<&String, String> = dirs
            .iter()
            .map(|d| (d, router.resolve_raw(d).unwrap()))
            .collect();

        let new_url = "tcp://new.moray.local:2020/";
        assert!(router.add_shard(new_url, new_url.to_string()));

        let mut moved = 0usize;
        for d in &dirs {
            let now = router.resolve_raw(d).unwrap();
            if now != before[d] {
                // A directory only ever moves onto the new shard
                assert_eq!(now, new_url);
                moved += 1;
            }
        }
        // Expected 1/5 of the directories; allow generous variance
        assert!(moved > 0);
        assert!(moved * 100 / dirs.len() <= 35, "moved {moved} of {}", dirs.len());
    }

    #[test]
    fn test_add_shard_idempotent() {
        let router = router(2);
        let topo = router.ring();
        assert!(!router.add_shard("tcp://0.moray.local:2020/", "other".to_string()));
        assert_eq!(router.ring(), topo);
        assert_eq!(
            router.get("tcp://0.moray.local:2020/").as_deref(),
            Some("tcp://0.moray.local:2020/")
        );
    }

    #[test]
    fn test_snapshot_survives_update() {
        let router = router(1);
        let snap = router.snapshot();
        router.add_shard("tcp://x:2020/", "x".to_string());
        assert_eq!(snap.members.len(), 1);
        assert_eq!(router.len(), 2);
        assert_eq!(router.remove_shard("tcp://x:2020/").as_deref(), Some("x"));
        assert_eq!(router.len(), 1);
    }
}
