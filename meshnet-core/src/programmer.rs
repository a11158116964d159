//! Peer programming: the contract between the reconciler and the local tunnel
//! interface, plus an in-memory implementation.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use ipnet::IpNet;

use crate::identity::{KeyError, Keypair, PublicKey};
use crate::node::NodeRecord;

/// Name of the WireGuard interface created in the host network namespace.
pub const DEVICE_NAME: &str = "clusternet";

/// UDP port every node's WireGuard interface listens on.
pub const WIREGUARD_PORT: u16 = 51820;

/// Routing protocol number marking the mesh route as ours.
pub const ROUTE_PROTOCOL: u8 = 129;

/// Mutations of the local tunnel interface. Two implementations exist: the
/// kernel-backed one in the daemon and [`MemoryProgrammer`].
pub trait PeerProgrammer: Send {
    /// Load the persisted private key, or generate and persist one. Calling
    /// it again keeps the key.
    fn ensure_key(&mut self) -> Result<(), ProgrammerError>;

    /// (Re)create the interface with the local key and fixed port, and route
    /// `mesh_cidr` through it. `ensure_key` must have been called.
    fn setup(&mut self, mesh_cidr: IpNet) -> Result<(), ProgrammerError>;

    /// Create or update peers for the given nodes. The node owning the local
    /// key is skipped. Allowed IPs are replaced, not merged. Any malformed
    /// node fails the whole call; callers bisect by retrying per node.
    fn configure_peers(&mut self, nodes: &[NodeRecord]) -> Result<(), ProgrammerError>;

    /// Remove the peer for `node`. Absent peers are not an error.
    fn unconfigure_peer(&mut self, node: &NodeRecord) -> Result<(), ProgrammerError>;

    /// Local keypair, once `ensure_key` succeeded.
    fn key(&self) -> Option<Keypair>;

    /// Release in-process handles. Kernel state is left in place.
    fn close(&mut self);
}

/// A validated peer configuration derived from a [`NodeRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub node: String,
    pub public_key: PublicKey,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpNet>,
}

impl Peer {
    pub fn from_node(node: &NodeRecord) -> Result<Self, ProgrammerError> {
        let public_key = parse_peer_key(node)?;
        let address: IpAddr =
            node.external_address
                .parse()
                .map_err(|_| ProgrammerError::InvalidAddress {
                    node: node.id.clone(),
                    address: node.external_address.clone(),
                })?;
        Ok(Self {
            node: node.id.clone(),
            public_key,
            endpoint: SocketAddr::new(address, WIREGUARD_PORT),
            allowed_ips: node.prefixes.iter().copied().collect(),
        })
    }
}

/// Parse the public key announced by `node`.
pub fn parse_peer_key(node: &NodeRecord) -> Result<PublicKey, ProgrammerError> {
    node.public_key
        .parse()
        .map_err(|source| ProgrammerError::InvalidKey {
            node: node.id.clone(),
            key: node.public_key.clone(),
            source,
        })
}

#[derive(Debug, thiserror::Error)]
pub enum ProgrammerError {
    #[error("no local key, ensure_key must run first")]
    NoKey,
    #[error("interface is not set up")]
    NotSetUp,
    #[error("node {node}: invalid public key {key:?}: {source}")]
    InvalidKey {
        node: String,
        key: String,
        #[source]
        source: KeyError,
    },
    #[error("node {node}: invalid external address {address:?}")]
    InvalidAddress { node: String, address: String },
    #[error("could not read key file {}: {source}", path.display())]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write key file {}: {source}", path.display())]
    KeySave {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid private key in {}: {source}", path.display())]
    StoredKey {
        path: PathBuf,
        #[source]
        source: KeyError,
    },
    #[error("{op}: {source}")]
    Kernel {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("synthetic failure")]
    Injected,
}

#[derive(Debug, Default)]
struct MemoryState {
    keypair: Option<Keypair>,
    mesh_cidr: Option<IpNet>,
    peers: HashMap<PublicKey, Peer>,
    fail_configures: usize,
    configure_calls: usize,
}

/// In-memory peer table. Clones share state so a test can keep a handle
/// while the reconciler owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryProgrammer {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a fixed local key instead of generating one.
    pub fn with_keypair(keypair: Keypair) -> Self {
        let p = Self::new();
        p.lock().keypair = Some(keypair);
        p
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not hide the table from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `n` calls to `configure_peers`.
    pub fn fail_next_configures(&self, n: usize) {
        self.lock().fail_configures = n;
    }

    /// Number of `configure_peers` calls seen, failed ones included.
    pub fn configure_calls(&self) -> usize {
        self.lock().configure_calls
    }

    pub fn mesh_cidr(&self) -> Option<IpNet> {
        self.lock().mesh_cidr
    }

    /// Snapshot of configured peers, sorted by node ID.
    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.node.cmp(&b.node));
        peers
    }

    pub fn peer(&self, key: &PublicKey) -> Option<Peer> {
        self.lock().peers.get(key).cloned()
    }
}

impl PeerProgrammer for MemoryProgrammer {
    fn ensure_key(&mut self) -> Result<(), ProgrammerError> {
        let mut st = self.lock();
        if st.keypair.is_none() {
            st.keypair = Some(Keypair::generate());
        }
        Ok(())
    }

    fn setup(&mut self, mesh_cidr: IpNet) -> Result<(), ProgrammerError> {
        let mut st = self.lock();
        if st.keypair.is_none() {
            return Err(ProgrammerError::NoKey);
        }
        st.mesh_cidr = Some(mesh_cidr);
        st.peers.clear();
        Ok(())
    }

    fn configure_peers(&mut self, nodes: &[NodeRecord]) -> Result<(), ProgrammerError> {
        let mut st = self.lock();
        st.configure_calls += 1;
        if st.mesh_cidr.is_none() {
            return Err(ProgrammerError::NotSetUp);
        }
        if st.fail_configures > 0 {
            st.fail_configures -= 1;
            return Err(ProgrammerError::Injected);
        }
        let local = match &st.keypair {
            Some(kp) => *kp.public_key(),
            None => return Err(ProgrammerError::NoKey),
        };
        let mut batch = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.public_key == local.to_base64() {
                continue;
            }
            batch.push(Peer::from_node(node)?);
        }
        for peer in batch {
            st.peers.insert(peer.public_key, peer);
        }
        Ok(())
    }

    fn unconfigure_peer(&mut self, node: &NodeRecord) -> Result<(), ProgrammerError> {
        let key = parse_peer_key(node)?;
        let mut st = self.lock();
        if st.mesh_cidr.is_none() {
            return Err(ProgrammerError::NotSetUp);
        }
        st.peers.remove(&key);
        Ok(())
    }

    fn key(&self) -> Option<Keypair> {
        self.lock().keypair.clone()
    }

    fn close(&mut self) {}
}
