pub mod hash;

pub use hash::{fnv_slice_key, jump_hash, Hasher, JumpHasher};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::DbResult;

/// Default number of partitions in the consistent-hash ring.
pub const DEFAULT_PARTITION_N: u32 = 256;

pub const DEFAULT_REPLICA_N: usize = 1;

/// A cluster member, identified by host:port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub host: String,
}

impl Node {
    pub fn new(host: &str) -> Node {
        Node {
            host: host.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

/// Membership capability: the live view of the cluster. The gossip service
/// sits behind this seam; a static implementation serves standalone mode
/// and tests.
pub trait NodeSet: Send + Sync {
    fn members(&self) -> Vec<Node>;
    /// Record hosts as live. Returns the member count.
    fn join(&self, hosts: Vec<String>) -> DbResult<usize>;
}

/// NodeSet with no discovery: whatever joined is live.
#[derive(Default)]
pub struct StaticNodeSet {
    hosts: RwLock<Vec<String>>,
}

impl StaticNodeSet {
    pub fn new() -> StaticNodeSet {
        StaticNodeSet::default()
    }

    /// A node set that already considers `hosts` live.
    pub fn with_hosts(hosts: Vec<String>) -> StaticNodeSet {
        StaticNodeSet {
            hosts: RwLock::new(hosts),
        }
    }
}

impl NodeSet for StaticNodeSet {
    fn members(&self) -> Vec<Node> {
        self.hosts.read().iter().map(|h| Node::new(h)).collect()
    }

    fn join(&self, hosts: Vec<String>) -> DbResult<usize> {
        let mut current = self.hosts.write();
        *current = hosts;
        Ok(current.len())
    }
}

/// The node list plus the two-layer partitioner: (index, slice) hashes to
/// a partition, the partition maps to a ring-ordered run of replica
/// owners. Every node computes the same assignment from the same list.
pub struct Cluster {
    pub nodes: Vec<Node>,
    pub partition_n: u32,
    pub replica_n: usize,
    hasher: Box<dyn Hasher>,
    pub node_set: Arc<dyn NodeSet>,
}

impl Cluster {
    pub fn new(nodes: Vec<Node>, replica_n: usize) -> Cluster {
        Cluster {
            node_set: Arc::new(StaticNodeSet::with_hosts(
                nodes.iter().map(|n| n.host.clone()).collect(),
            )),
            nodes,
            partition_n: DEFAULT_PARTITION_N,
            replica_n: replica_n.max(1),
            hasher: Box::new(JumpHasher),
        }
    }

    /// A single-node cluster for standalone mode.
    pub fn standalone(host: &str) -> Cluster {
        Cluster::new(vec![Node::new(host)], 1)
    }

    pub fn with_hasher(mut self, hasher: Box<dyn Hasher>) -> Cluster {
        self.hasher = hasher;
        self
    }

    pub fn with_node_set(mut self, node_set: Arc<dyn NodeSet>) -> Cluster {
        self.node_set = node_set;
        self
    }

    /// The partition owning a shard of an index.
    pub fn partition(&self, index: &str, slice: u64) -> u32 {
        self.hasher
            .hash(fnv_slice_key(index, slice), self.partition_n)
    }

    /// The replica owners of a partition: first owner at
    /// `partition mod N`, the rest following the node list in ring order.
    pub fn partition_nodes(&self, partition: u32) -> Vec<Node> {
        if self.nodes.is_empty() {
            return Vec::new();
        }
        let first = partition as usize % self.nodes.len();
        let count = self.replica_n.min(self.nodes.len());
        (0..count)
            .map(|i| self.nodes[(first + i) % self.nodes.len()].clone())
            .collect()
    }

    /// The replica owners of (index, slice).
    pub fn owners(&self, index: &str, slice: u64) -> Vec<Node> {
        self.partition_nodes(self.partition(index, slice))
    }

    pub fn is_local(&self, index: &str, slice: u64, host: &str) -> bool {
        self.owners(index, slice).iter().any(|n| n.host == host)
    }

    /// Health of every configured node. Configured hosts missing from the
    /// live membership view are DOWN; extra live hosts are ignored.
    pub fn health(&self) -> BTreeMap<String, NodeStatus> {
        let live: Vec<Node> = self.node_set.members();
        self.nodes
            .iter()
            .map(|n| {
                let status = if live.iter().any(|m| m.host == n.host) {
                    NodeStatus::Up
                } else {
                    NodeStatus::Down
                };
                (n.host.clone(), status)
            })
            .collect()
    }
}
