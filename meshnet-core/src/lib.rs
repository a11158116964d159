//! Cluster mesh networking core.
//! No kernel or network I/O: prefix sets, node reconciliation, WireGuard
//! identity, the directory wire protocol and the peer programming contract.

pub mod identity;
pub mod node;
pub mod prefix;
pub mod programmer;
pub mod protocol;
pub mod wire;

pub use identity::{KeyError, Keypair, PublicKey};
pub use node::{NodeDiff, NodeMap, NodeRecord, WatchBatch};
pub use prefix::PrefixSet;
pub use programmer::{MemoryProgrammer, Peer, PeerProgrammer, ProgrammerError};
pub use protocol::{Message, NodeEntry, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError};
