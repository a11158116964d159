//! Push loop: announce this node's public key and prefixes to the directory,
//! always converging on the latest locally known prefixes.

use std::net::IpAddr;

use meshnet_core::PrefixSet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::directory::{Directory, NetworkingUpdate};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("{0} source closed")]
    SourceClosed(&'static str),
}

/// Inputs of the push loop.
pub struct PushSources {
    /// Prefixes assigned to this node by IPAM.
    pub prefixes: watch::Receiver<PrefixSet>,
    /// This node's external address, announced as a host prefix.
    pub address: watch::Receiver<Option<IpAddr>>,
}

/// Run until cancelled. Returns an error only when an input source closes.
pub async fn run(
    cancel: &CancellationToken,
    directory: &dyn Directory,
    node_id: &str,
    public_key: &str,
    sources: &mut PushSources,
) -> Result<(), PushError> {
    let mut published: Option<PrefixSet> = None;
    loop {
        let want = announced(sources);
        if published.as_ref() != Some(&want) {
            info!(prefixes = %want, "submitting prefixes");
            let update = NetworkingUpdate {
                node_id: node_id.to_string(),
                public_key: public_key.to_string(),
                prefixes: want.clone(),
            };
            // An abandoned request may still land, so the directory holds an
            // unknown value until a publish is acknowledged.
            published = None;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = sources.prefixes.changed() => {
                    res.map_err(|_| PushError::SourceClosed("prefixes"))?;
                    debug!("prefixes changed while submitting, starting over");
                    continue;
                }
                res = sources.address.changed() => {
                    res.map_err(|_| PushError::SourceClosed("address"))?;
                    debug!("address changed while submitting, starting over");
                    continue;
                }
                () = publish(directory, &update) => {
                    info!(prefixes = %want, "prefixes submitted");
                    published = Some(want);
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            res = sources.prefixes.changed() => {
                res.map_err(|_| PushError::SourceClosed("prefixes"))?;
            }
            res = sources.address.changed() => {
                res.map_err(|_| PushError::SourceClosed("address"))?;
            }
        }
    }
}

/// Everything this node announces: its own address plus IPAM prefixes.
fn announced(sources: &mut PushSources) -> PrefixSet {
    let mut set = match *sources.address.borrow_and_update() {
        Some(addr) => PrefixSet::host(addr),
        None => PrefixSet::new(),
    };
    set.merge(&sources.prefixes.borrow_and_update());
    set
}

/// Submit `update` until the directory accepts it. Never gives up; callers
/// abandon it by dropping the future.
async fn publish(directory: &dyn Directory, update: &NetworkingUpdate) {
    let mut backoff = Backoff::new();
    loop {
        match directory.update_node_networking(update).await {
            Ok(()) => return,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    attempt = backoff.attempts(),
                    retry_in = ?delay,
                    "could not submit cluster networking update: {e}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeDirectory, UpdateReply};
    use std::sync::Arc;
    use std::time::Duration;

    fn set(cidrs: &[&str]) -> PrefixSet {
        PrefixSet::from_cidrs(cidrs).0
    }

    struct Harness {
        cancel: CancellationToken,
        prefixes: watch::Sender<PrefixSet>,
        address: watch::Sender<Option<IpAddr>>,
        task: tokio::task::JoinHandle<Result<(), PushError>>,
    }

    fn start(dir: &FakeDirectory, initial: PrefixSet, addr: Option<IpAddr>) -> Harness {
        let cancel = CancellationToken::new();
        let (prefixes, prefixes_rx) = watch::channel(initial);
        let (address, address_rx) = watch::channel(addr);
        let dir = Arc::new(dir.clone());
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut sources = PushSources {
                prefixes: prefixes_rx,
                address: address_rx,
            };
            run(&token, dir.as_ref(), "n1", "pubkey", &mut sources).await
        });
        Harness {
            cancel,
            prefixes,
            address,
            task,
        }
    }

    async fn wait_published(dir: &FakeDirectory, n: usize) -> Vec<NetworkingUpdate> {
        for _ in 0..1000 {
            let p = dir.published();
            if p.len() >= n {
                return p;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} published updates, got {:?}", dir.published());
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_initial_prefixes_with_address() {
        let (dir, _attempts) = FakeDirectory::new();
        let h = start(
            &dir,
            set(&["10.0.0.0/24"]),
            Some("192.0.2.1".parse().unwrap()),
        );
        let published = wait_published(&dir, 1).await;
        assert_eq!(published[0].node_id, "n1");
        assert_eq!(published[0].public_key, "pubkey");
        assert_eq!(published[0].prefixes.to_string(), "10.0.0.0/24,192.0.2.1/32");

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_accepted() {
        let (dir, mut attempts) = FakeDirectory::new();
        dir.script(&[UpdateReply::Fail, UpdateReply::Fail]);
        let h = start(&dir, set(&["10.0.0.0/24"]), None);
        for _ in 0..3 {
            attempts.recv().await.unwrap();
        }
        let published = wait_published(&dir, 1).await;
        assert_eq!(published.len(), 1);
        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stale_publish_is_abandoned_for_newer_prefixes() {
        let (dir, mut attempts) = FakeDirectory::new();
        let stale = set(&["10.0.0.0/24"]);
        let newer = set(&["10.0.0.0/24", "10.0.1.0/24"]);
        dir.script(&[UpdateReply::Fail, UpdateReply::Fail, UpdateReply::Hang]);
        let h = start(&dir, stale.clone(), None);

        for _ in 0..3 {
            let a = attempts.recv().await.unwrap();
            assert_eq!(a.prefixes, stale);
        }
        // Third attempt is hanging in flight.
        h.prefixes.send(newer.clone()).unwrap();

        let a = attempts.recv().await.unwrap();
        assert_eq!(a.prefixes, newer);
        let published = wait_published(&dir, 1).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].prefixes, newer);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert!(dir.published().iter().all(|u| u.prefixes != stale));
    }

    #[tokio::test(start_paused = true)]
    async fn change_during_backoff_restarts_with_latest() {
        let (dir, mut attempts) = FakeDirectory::new();
        dir.script(&[UpdateReply::Fail]);
        let h = start(&dir, set(&["10.0.0.0/24"]), None);
        attempts.recv().await.unwrap();
        // Loop is sleeping in backoff now.
        h.address.send(Some("192.0.2.9".parse().unwrap())).unwrap();
        let a = attempts.recv().await.unwrap();
        assert_eq!(a.prefixes.to_string(), "10.0.0.0/24,192.0.2.9/32");
        let published = wait_published(&dir, 1).await;
        assert_eq!(published[0].prefixes.to_string(), "10.0.0.0/24,192.0.2.9/32");
        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spurious_update_is_not_republished() {
        let (dir, mut attempts) = FakeDirectory::new();
        let h = start(&dir, set(&["10.0.0.0/24"]), None);
        attempts.recv().await.unwrap();
        wait_published(&dir, 1).await;

        // Same set, different order of insertion.
        h.prefixes.send(set(&["10.0.0.0/24"])).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(attempts.try_recv().is_err());

        h.prefixes.send(set(&["10.0.2.0/24"])).unwrap();
        let a = attempts.recv().await.unwrap();
        assert_eq!(a.prefixes.to_string(), "10.0.2.0/24");

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reverting_after_abandoned_publish_is_resent() {
        let (dir, mut attempts) = FakeDirectory::new();
        let first = set(&["10.0.0.0/24"]);
        let second = set(&["10.0.1.0/24"]);
        let h = start(&dir, first.clone(), None);
        assert_eq!(attempts.recv().await.unwrap().prefixes, first);
        wait_published(&dir, 1).await;

        // The second value reaches the directory but is never acknowledged.
        dir.script(&[UpdateReply::Hang]);
        h.prefixes.send(second.clone()).unwrap();
        assert_eq!(attempts.recv().await.unwrap().prefixes, second);

        h.prefixes.send(first.clone()).unwrap();
        let resent = tokio::time::timeout(Duration::from_secs(60), attempts.recv())
            .await
            .expect("reverted value was not published again")
            .unwrap();
        assert_eq!(resent.prefixes, first);
        let published = wait_published(&dir, 2).await;
        assert_eq!(published[1].prefixes, first);

        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_hanging_publish() {
        let (dir, mut attempts) = FakeDirectory::new();
        dir.script(&[UpdateReply::Hang]);
        let h = start(&dir, set(&["10.0.0.0/24"]), None);
        attempts.recv().await.unwrap();
        h.cancel.cancel();
        h.task.await.unwrap().unwrap();
        assert!(dir.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_source_is_an_error() {
        let (dir, _attempts) = FakeDirectory::new();
        let h = start(&dir, set(&["10.0.0.0/24"]), None);
        wait_published(&dir, 1).await;
        drop(h.prefixes);
        let err = h.task.await.unwrap().unwrap_err();
        assert!(matches!(err, PushError::SourceClosed("prefixes")));
    }
}
