//! Service wiring: prepare the interface, then keep the push and pull loops
//! running until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ipnet::IpNet;
use meshnet_core::PeerProgrammer;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::push::{self, PushSources};
use crate::pull::{self, Reconciler};

pub struct Settings {
    pub node_id: String,
    pub mesh_cidr: IpNet,
    /// Pause before a failed loop is started again.
    pub restart_delay: Duration,
}

/// A loop the supervisor restarts when it fails.
#[async_trait]
pub trait Supervised: Send {
    /// Run until cancelled (`Ok`) or until something breaks (`Err`).
    async fn run_once(&mut self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Called once the supervisor gives up on the loop for good.
    fn stop(&mut self) {}
}

/// Run `task` again after `delay` every time it returns, until `cancel`
/// fires.
pub async fn supervise<T: Supervised>(
    name: &'static str,
    mut task: T,
    cancel: CancellationToken,
    delay: Duration,
) {
    loop {
        match task.run_once(&cancel).await {
            Ok(()) if cancel.is_cancelled() => break,
            Ok(()) => warn!(task = name, "exited unexpectedly, restarting in {delay:?}"),
            Err(e) => warn!(task = name, "failed: {e:#}, restarting in {delay:?}"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    task.stop();
    debug!(task = name, "stopped");
}

struct PushTask {
    directory: Arc<dyn Directory>,
    node_id: String,
    public_key: String,
    sources: PushSources,
}

#[async_trait]
impl Supervised for PushTask {
    async fn run_once(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        push::run(
            cancel,
            self.directory.as_ref(),
            &self.node_id,
            &self.public_key,
            &mut self.sources,
        )
        .await?;
        Ok(())
    }
}

struct PullTask {
    directory: Arc<dyn Directory>,
    // Outlives each watch, so a reopened watch is diffed against what is
    // already programmed.
    reconciler: Reconciler,
}

#[async_trait]
impl Supervised for PullTask {
    async fn run_once(&mut self, cancel: &CancellationToken) -> anyhow::Result<()> {
        pull::run(cancel, self.directory.as_ref(), &mut self.reconciler).await?;
        Ok(())
    }

    fn stop(&mut self) {
        self.reconciler.close();
    }
}

/// Ensure the key, set up the interface and run both loops. Returns once
/// `cancel` fired and both loops stopped; fails only if the interface could
/// not be prepared.
pub async fn run(
    cancel: CancellationToken,
    settings: Settings,
    directory: Arc<dyn Directory>,
    mut programmer: Box<dyn PeerProgrammer>,
    sources: PushSources,
) -> anyhow::Result<()> {
    programmer
        .ensure_key()
        .context("could not load or create WireGuard key")?;
    programmer
        .setup(settings.mesh_cidr)
        .context("could not set up WireGuard interface")?;
    let public_key = programmer
        .key()
        .context("no local key after ensure_key")?
        .public_key()
        .to_base64();
    info!(
        node = %settings.node_id,
        public_key = %public_key,
        mesh = %settings.mesh_cidr,
        "cluster networking starting"
    );

    let push = tokio::spawn(supervise(
        "push",
        PushTask {
            directory: directory.clone(),
            node_id: settings.node_id,
            public_key,
            sources,
        },
        cancel.clone(),
        settings.restart_delay,
    ));
    let pull = tokio::spawn(supervise(
        "pull",
        PullTask {
            directory,
            reconciler: Reconciler::new(programmer),
        },
        cancel.clone(),
        settings.restart_delay,
    ));

    let (push, pull) = tokio::join!(push, pull);
    push.context("push task panicked")?;
    pull.context("pull task panicked")?;
    info!("cluster networking stopped");
    Ok(())
}
