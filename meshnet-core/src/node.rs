//! Reconciled view of cluster nodes and the diffing update that feeds peer
//! programming.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::prefix::PrefixSet;
use crate::protocol::NodeEntry;

/// Last known state of one cluster member, as relevant to the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: String,
    /// Base64 WireGuard public key, as announced. Validated when programmed.
    pub public_key: String,
    /// External address the node's tunnel endpoint listens on, as announced.
    pub external_address: String,
    pub prefixes: PrefixSet,
}

impl NodeRecord {
    /// Convert a directory entry. Unparsable prefixes are dropped with a
    /// warning, the rest of the entry is kept verbatim.
    pub fn from_entry(entry: NodeEntry) -> Self {
        let (prefixes, invalid) = PrefixSet::from_cidrs(&entry.prefixes);
        for cidr in invalid {
            warn!(node = %entry.id, %cidr, "ignoring unparsable prefix");
        }
        Self {
            id: entry.id,
            public_key: entry.public_key,
            external_address: entry.external_address,
            prefixes,
        }
    }

    /// Whether the node carries everything needed to become a peer.
    pub fn is_complete(&self) -> bool {
        !self.public_key.is_empty() && !self.external_address.is_empty()
    }

    fn same_state(&self, other: &NodeRecord) -> bool {
        self.public_key == other.public_key
            && self.external_address == other.external_address
            && self.prefixes == other.prefixes
    }
}

/// One notification from the directory.
#[derive(Debug, Clone, Default)]
pub struct WatchBatch {
    /// Nodes that are new or possibly changed. When `resync` is set, this is
    /// the complete set of nodes in the cluster.
    pub nodes: Vec<NodeRecord>,
    /// IDs of nodes removed from the cluster.
    pub removed: Vec<String>,
    /// Full resync: any known node not listed in `nodes` is gone.
    pub resync: bool,
}

/// Result of applying a batch to a [`NodeMap`]. Order is not significant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeDiff {
    pub updated: Vec<NodeRecord>,
    /// Records whose peers must be dropped: deleted nodes, and the previous
    /// record of a node that changed its public key.
    pub removed: Vec<NodeRecord>,
}

impl NodeDiff {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Snapshot of all known nodes, keyed by node ID.
#[derive(Debug, Default)]
pub struct NodeMap {
    nodes: HashMap<String, NodeRecord>,
}

impl NodeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fold a batch into the map and return what changed.
    pub fn update(&mut self, batch: WatchBatch) -> NodeDiff {
        let mut diff = NodeDiff::default();
        let listed: HashSet<String> = batch.nodes.iter().map(|n| n.id.clone()).collect();
        let tombstoned: HashSet<String> = batch.removed.iter().cloned().collect();

        // Removals go first so keys they release can be claimed in the same
        // batch.
        for id in batch.removed {
            match self.nodes.remove(&id) {
                Some(prev) => diff.removed.push(prev),
                None => warn!(node = %id, "removal of unknown node"),
            }
        }
        if batch.resync {
            let gone: Vec<String> = self
                .nodes
                .keys()
                .filter(|id| !listed.contains(*id))
                .cloned()
                .collect();
            for id in gone {
                if let Some(prev) = self.nodes.remove(&id) {
                    diff.removed.push(prev);
                }
            }
        }

        // Public key → owning node ID. The directory should never hand out the
        // same key twice, but routing must not break if it does.
        let mut owners: HashMap<String, String> = self
            .nodes
            .values()
            .map(|n| (n.public_key.clone(), n.id.clone()))
            .collect();

        for node in batch.nodes {
            if tombstoned.contains(&node.id) {
                continue;
            }
            if !node.is_complete() {
                // Likely transient; keep whatever we had for this node.
                debug!(node = %node.id, "skipping node without key or address");
                continue;
            }
            if let Some(owner) = owners.get(&node.public_key) {
                if *owner != node.id {
                    warn!(
                        node = %node.id,
                        other = %owner,
                        key = %node.public_key,
                        "nodes share a WireGuard public key, skipping"
                    );
                    continue;
                }
            }
            let prev = match self.nodes.get(&node.id) {
                Some(prev) if prev.same_state(&node) => continue,
                Some(prev) => Some(prev.clone()),
                None => None,
            };
            if let Some(prev) = prev {
                if prev.public_key != node.public_key {
                    // Peers are keyed by public key: the old one has to go.
                    owners.remove(&prev.public_key);
                    diff.removed.push(prev);
                }
            }
            owners.insert(node.public_key.clone(), node.id.clone());
            self.nodes.insert(node.id.clone(), node.clone());
            diff.updated.push(node);
        }

        diff
    }
}
