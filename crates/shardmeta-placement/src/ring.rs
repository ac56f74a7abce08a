//! Consistent hash ring with virtual nodes.
//!
//! Virtual node `i` of a node named `u` sits at the ring position of the
//! string `"{u}-{i}"`. A key belongs to the first virtual node at or after
//! its own position, wrapping around past the end.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use shardmeta_common::HashAlgorithm;
use std::collections::BTreeMap;
use std::fmt;

/// Position of `data` on the ring: the first eight bytes of the digest,
/// big-endian, or the xxh64 value itself.
#[must_use]
pub fn ring_position(algorithm: HashAlgorithm, data: &[u8]) -> u64 {
    fn prefix(digest: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(buf)
    }

    match algorithm {
        HashAlgorithm::Sha1 => prefix(&Sha1::digest(data)),
        HashAlgorithm::Sha256 => prefix(&Sha256::digest(data)),
        HashAlgorithm::Xxh64 => xxhash_rust::xxh64::xxh64(data, 0),
    }
}

/// Serialisable description of a ring, enough to rebuild it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingTopology {
    pub algorithm: HashAlgorithm,
    pub replicas: u32,
    /// Node names in ascending order
    pub nodes: Vec<String>,
    /// Number of occupied ring positions
    pub vnodes: usize,
}

/// A consistent hash ring over named nodes
#[derive(Clone, Debug)]
pub struct HashRing {
    algorithm: HashAlgorithm,
    replicas: u32,
    /// Ring position -> nodes claiming it, ascending; the first one owns it
    vnodes: BTreeMap<u64, Vec<String>>,
    nodes: Vec<String>,
}

impl HashRing {
    /// Create an empty ring placing `replicas` virtual nodes per node
    #[must_use]
    pub fn new(algorithm: HashAlgorithm, replicas: u32) -> Self {
        Self {
            algorithm,
            replicas: replicas.max(1),
            vnodes: BTreeMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Rebuild a ring from an exported topology
    #[must_use]
    pub fn from_topology(topology: &RingTopology) -> Self {
        let mut ring = Self::new(topology.algorithm, topology.replicas);
        for node in &topology.nodes {
            ring.add_node(node);
        }
        ring
    }

    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    #[must_use]
    pub const fn replicas(&self) -> u32 {
        self.replicas
    }

    /// Node names in ascending order
    #[must_use]
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    #[must_use]
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.binary_search_by(|n| n.as_str().cmp(node)).is_ok()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn vnode_positions(&self, node: &str) -> impl Iterator<Item = u64> + '_ {
        let node = node.to_string();
        (0..self.replicas)
            .map(move |i| ring_position(self.algorithm, format!("{node}-{i}").as_bytes()))
    }

    /// Add a node. Returns `false` if it was already present.
    pub fn add_node(&mut self, node: &str) -> bool {
        let Err(idx) = self.nodes.binary_search_by(|n| n.as_str().cmp(node)) else {
            return false;
        };
        self.nodes.insert(idx, node.to_string());

        let positions: Vec<u64> = self.vnode_positions(node).collect();
        for pos in positions {
            let claimants = self.vnodes.entry(pos).or_default();
            if let Err(i) = claimants.binary_search_by(|n| n.as_str().cmp(node)) {
                claimants.insert(i, node.to_string());
            }
        }
        true
    }

    /// Remove a node. Returns `false` if it was not present.
    pub fn remove_node(&mut self, node: &str) -> bool {
        let Ok(idx) = self.nodes.binary_search_by(|n| n.as_str().cmp(node)) else {
            return false;
        };
        self.nodes.remove(idx);

        let positions: Vec<u64> = self.vnode_positions(node).collect();
        for pos in positions {
            if let Some(claimants) = self.vnodes.get_mut(&pos) {
                claimants.retain(|n| n != node);
                if claimants.is_empty() {
                    self.vnodes.remove(&pos);
                }
            }
        }
        true
    }

    /// Node owning `key`, or `None` if the ring is empty
    #[must_use]
    pub fn node_for(&self, key: &str) -> Option<&str> {
        let hash = ring_position(self.algorithm, key.as_bytes());
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .and_then(|(_, claimants)| claimants.first())
            .map(String::as_str)
    }

    /// Export the topology
    #[must_use]
    pub fn topology(&self) -> RingTopology {
        RingTopology {
            algorithm: self.algorithm,
            replicas: self.replicas,
            nodes: self.nodes.clone(),
            vnodes: self.vnodes.len(),
        }
    }
}

impl fmt::Display for HashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HashRing<algorithm={}, replicas={}, nodes=[{}]>",
            self.algorithm,
            self.replicas,
            self.nodes.join(", ")
        )
    }
}
