//! Directory client: watch all cluster nodes and publish this node's mesh
//! configuration. The directory speaks length-prefixed bincode frames over TCP.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use meshnet_core::{
    encode_frame, FrameBuffer, FrameDecodeError, FrameEncodeError, Message, NodeRecord, PrefixSet,
    WatchBatch, PROTOCOL_VERSION,
};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// A watch may sit idle for a long time; keepalive notices a directory
// that vanished without closing the connection.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_RETRIES: u32 = 3;

/// What this node announces: its public key and prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkingUpdate {
    pub node_id: String,
    pub public_key: String,
    pub prefixes: PrefixSet,
}

/// Access to the cluster directory.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Open a watch on all nodes. The first batch is a full resync.
    async fn watch_nodes(&self) -> Result<Box<dyn NodeWatch>, DirectoryError>;

    /// Store this node's key and prefixes in the directory.
    async fn update_node_networking(&self, update: &NetworkingUpdate) -> Result<(), DirectoryError>;
}

/// A long-lived stream of node batches.
#[async_trait]
pub trait NodeWatch: Send {
    /// Next batch, or `None` once the directory closed the stream.
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>, DirectoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory i/o: {0}")]
    Io(#[from] io::Error),
    #[error("encoding request: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("decoding response: {0}")]
    Decode(#[from] FrameDecodeError),
    #[error("timed out talking to directory")]
    Timeout,
    #[error("directory closed the connection")]
    Closed,
    #[error("directory rejected request: {0}")]
    Rejected(String),
    #[error("unexpected message from directory: {0}")]
    Unexpected(&'static str),
}

/// Directory reached over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpDirectory {
    addr: SocketAddr,
}

impl TcpDirectory {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    async fn connect(&self) -> Result<TcpStream, DirectoryError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| DirectoryError::Timeout)??;
        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_IDLE)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        Ok(stream)
    }

    async fn exchange_update(&self, update: &NetworkingUpdate) -> Result<(), DirectoryError> {
        let mut stream = self.connect().await?;
        write_message(
            &mut stream,
            &Message::UpdateNodeNetworking {
                protocol_version: PROTOCOL_VERSION,
                node_id: update.node_id.clone(),
                public_key: update.public_key.clone(),
                prefixes: update.prefixes.to_cidrs(),
            },
        )
        .await?;
        let mut frames = FrameBuffer::new();
        match read_message(&mut stream, &mut frames).await? {
            Some(Message::UpdateAck) => Ok(()),
            Some(Message::Error { reason }) => Err(DirectoryError::Rejected(reason)),
            Some(_) => Err(DirectoryError::Unexpected("expected UpdateAck")),
            None => Err(DirectoryError::Closed),
        }
    }
}

#[async_trait]
impl Directory for TcpDirectory {
    async fn watch_nodes(&self) -> Result<Box<dyn NodeWatch>, DirectoryError> {
        let mut stream = self.connect().await?;
        write_message(
            &mut stream,
            &Message::WatchNodes {
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await?;
        debug!(directory = %self.addr, "watch opened");
        Ok(Box::new(TcpNodeWatch {
            stream,
            frames: FrameBuffer::new(),
        }))
    }

    async fn update_node_networking(&self, update: &NetworkingUpdate) -> Result<(), DirectoryError> {
        tokio::time::timeout(REQUEST_TIMEOUT, self.exchange_update(update))
            .await
            .map_err(|_| DirectoryError::Timeout)?
    }
}

struct TcpNodeWatch {
    stream: TcpStream,
    frames: FrameBuffer,
}

#[async_trait]
impl NodeWatch for TcpNodeWatch {
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>, DirectoryError> {
        match read_message(&mut self.stream, &mut self.frames).await? {
            Some(Message::NodeEvent {
                nodes,
                tombstones,
                resync,
            }) => Ok(Some(WatchBatch {
                nodes: nodes.into_iter().map(NodeRecord::from_entry).collect(),
                removed: tombstones,
                resync,
            })),
            Some(Message::Error { reason }) => Err(DirectoryError::Rejected(reason)),
            Some(_) => Err(DirectoryError::Unexpected("expected NodeEvent")),
            None => Ok(None),
        }
    }
}

/// Write one framed message.
pub(crate) async fn write_message(
    stream: &mut TcpStream,
    msg: &Message,
) -> Result<(), DirectoryError> {
    let frame = encode_frame(msg)?;
    stream.write_all(&frame).await?;
    Ok(())
}

/// Read one framed message. `None` on a clean end of stream between frames.
pub(crate) async fn read_message(
    stream: &mut TcpStream,
    frames: &mut FrameBuffer,
) -> Result<Option<Message>, DirectoryError> {
    let mut buf = [0u8; 8192];
    loop {
        if let Some(msg) = frames.next_message()? {
            return Ok(Some(msg));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            if frames.pending() == 0 {
                return Ok(None);
            }
            return Err(DirectoryError::Closed);
        }
        frames.extend(&buf[..n]);
    }
}
