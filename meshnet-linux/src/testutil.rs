//! In-process directory used by the loop tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use meshnet_core::WatchBatch;
use tokio::sync::mpsc;

use crate::directory::{Directory, DirectoryError, NetworkingUpdate, NodeWatch};

/// How the fake directory answers one `update_node_networking` call.
#[derive(Debug, Clone, Copy)]
pub enum UpdateReply {
    Fail,
    /// Never answer; the caller has to give up on its own.
    Hang,
    Accept,
}

#[derive(Default)]
struct State {
    script: VecDeque<UpdateReply>,
    published: Vec<NetworkingUpdate>,
    watches: VecDeque<mpsc::UnboundedReceiver<Result<WatchBatch, DirectoryError>>>,
    watch_opens: usize,
}

#[derive(Clone)]
pub struct FakeDirectory {
    state: Arc<Mutex<State>>,
    attempts: mpsc::UnboundedSender<NetworkingUpdate>,
}

impl FakeDirectory {
    /// Returns the directory and a receiver of every update attempt.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NetworkingUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(State::default())),
                attempts: tx,
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answers for the next update calls; unscripted calls are accepted.
    pub fn script(&self, replies: &[UpdateReply]) {
        self.lock().script.extend(replies.iter().copied());
    }

    /// Updates the directory accepted.
    pub fn published(&self) -> Vec<NetworkingUpdate> {
        self.lock().published.clone()
    }

    /// Queue a watch stream for the next `watch_nodes` call. Dropping the
    /// sender ends the stream.
    pub fn add_watch(&self) -> mpsc::UnboundedSender<Result<WatchBatch, DirectoryError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().watches.push_back(rx);
        tx
    }

    pub fn watch_opens(&self) -> usize {
        self.lock().watch_opens
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn watch_nodes(&self) -> Result<Box<dyn NodeWatch>, DirectoryError> {
        let mut st = self.lock();
        st.watch_opens += 1;
        match st.watches.pop_front() {
            Some(rx) => Ok(Box::new(FakeWatch { rx })),
            None => Err(DirectoryError::Closed),
        }
    }

    async fn update_node_networking(&self, update: &NetworkingUpdate) -> Result<(), DirectoryError> {
        let _ = self.attempts.send(update.clone());
        let reply = self.lock().script.pop_front().unwrap_or(UpdateReply::Accept);
        match reply {
            UpdateReply::Fail => Err(DirectoryError::Rejected("synthetic failure".into())),
            UpdateReply::Hang => std::future::pending().await,
            UpdateReply::Accept => {
                self.lock().published.push(update.clone());
                Ok(())
            }
        }
    }
}

struct FakeWatch {
    rx: mpsc::UnboundedReceiver<Result<WatchBatch, DirectoryError>>,
}

#[async_trait]
impl NodeWatch for FakeWatch {
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>, DirectoryError> {
        self.rx.recv().await.transpose()
    }
}
