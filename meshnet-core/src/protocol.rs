//! Directory wire protocol: message types and version.

use serde::{Deserialize, Serialize};

/// Current protocol version. Carried in every request to the directory.
pub const PROTOCOL_VERSION: u8 = 1;

/// A node as the directory describes it. Keys, addresses and prefixes are
/// plain strings on the wire; they are validated by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub public_key: String,
    pub external_address: String,
    pub prefixes: Vec<String>,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Open a watch on all nodes in the cluster. The directory answers with a
    /// stream of `NodeEvent`s, the first of which is a full resync.
    WatchNodes { protocol_version: u8 },
    /// Node changes. `tombstones` lists IDs of removed nodes.
    NodeEvent {
        nodes: Vec<NodeEntry>,
        tombstones: Vec<String>,
        resync: bool,
    },
    /// Publish this node's mesh key and announced prefixes.
    UpdateNodeNetworking {
        protocol_version: u8,
        node_id: String,
        public_key: String,
        prefixes: Vec<String>,
    },
    /// Directory accepted an `UpdateNodeNetworking`.
    UpdateAck,
    /// Directory rejected a request.
    Error { reason: String },
}
