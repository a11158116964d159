//! Pull loop: watch the directory and program a peer for every other node.

use meshnet_core::{NodeDiff, NodeMap, NodeRecord, PeerProgrammer, WatchBatch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::{Directory, DirectoryError};

#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("watch failed: {0}")]
    Watch(#[from] DirectoryError),
    #[error("watch ended")]
    StreamEnded,
}

/// Outcome of applying one diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub configured: usize,
    pub failed: usize,
    pub removed: usize,
    pub remove_failed: usize,
}

/// Node view plus the programmer it is applied to. Kept across watches so
/// the resync that opens a new watch can drop nodes deleted in between.
pub struct Reconciler {
    programmer: Box<dyn PeerProgrammer>,
    nodes: NodeMap,
}

impl Reconciler {
    pub fn new(programmer: Box<dyn PeerProgrammer>) -> Self {
        Self {
            programmer,
            nodes: NodeMap::new(),
        }
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    /// Reconcile one batch and apply the resulting diff.
    pub fn handle(&mut self, batch: WatchBatch) -> ApplyReport {
        let diff = self.nodes.update(batch);
        if diff.is_empty() {
            debug!("batch changed nothing");
            return ApplyReport::default();
        }
        self.apply(&diff)
    }

    /// Removals first, then one bulk configure. If the bulk call fails, every
    /// node is retried on its own so one bad node cannot block the others.
    pub fn apply(&mut self, diff: &NodeDiff) -> ApplyReport {
        let mut report = ApplyReport::default();
        let local = self.programmer.key().map(|k| k.public_key().to_base64());
        let is_local = |node: &NodeRecord| local.as_deref() == Some(node.public_key.as_str());

        for node in diff.removed.iter().filter(|n| !is_local(*n)) {
            match self.programmer.unconfigure_peer(node) {
                Ok(()) => {
                    debug!(node = %node.id, "peer removed");
                    report.removed += 1;
                }
                Err(e) => {
                    error!(node = %node.id, "could not remove peer: {e}");
                    report.remove_failed += 1;
                }
            }
        }

        let mut peers = Vec::with_capacity(diff.updated.len());
        for node in &diff.updated {
            if is_local(node) {
                debug!(node = %node.id, "not peering with own node");
            } else {
                peers.push(node.clone());
            }
        }
        if peers.is_empty() {
            return report;
        }
        match self.programmer.configure_peers(&peers) {
            Ok(()) => report.configured = peers.len(),
            Err(e) => {
                warn!(nodes = peers.len(), "bulk peer update failed, retrying per node: {e}");
                for node in &peers {
                    match self.programmer.configure_peers(std::slice::from_ref(node)) {
                        Ok(()) => report.configured += 1,
                        Err(e) => {
                            error!(node = %node.id, "could not configure peer: {e}");
                            report.failed += 1;
                        }
                    }
                }
                info!(
                    configured = report.configured,
                    failed = report.failed,
                    "per-node peer update done"
                );
            }
        }
        report
    }

    /// Release the programmer's handles.
    pub fn close(&mut self) {
        self.programmer.close();
    }
}

/// Watch all nodes until cancelled. Any watch error or the end of the stream
/// is returned so the caller can start over with a fresh watch.
pub async fn run(
    cancel: &CancellationToken,
    directory: &dyn Directory,
    reconciler: &mut Reconciler,
) -> Result<(), PullError> {
    let mut watch = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        res = directory.watch_nodes() => res?,
    };
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = watch.next_batch() => res?,
        };
        let Some(batch) = batch else {
            return Err(PullError::StreamEnded);
        };
        debug!(
            nodes = batch.nodes.len(),
            removed = batch.removed.len(),
            resync = batch.resync,
            "watch event"
        );
        let report = reconciler.handle(batch);
        if report != ApplyReport::default() {
            info!(
                configured = report.configured,
                failed = report.failed,
                removed = report.removed,
                remove_failed = report.remove_failed,
                known = reconciler.nodes().len(),
                "peers reconciled"
            );
        }
    }
}
