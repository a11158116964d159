// meshnet daemon: publishes this node's prefixes to the directory and keeps
// the clusternet WireGuard interface in sync with every other node.

mod backoff;
mod config;
mod directory;
mod keyfile;
mod pull;
mod push;
mod service;
#[cfg(test)]
mod testutil;
mod wireguard;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use meshnet_core::PrefixSet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::directory::{Directory, TcpDirectory};
use crate::keyfile::KeyFile;
use crate::push::PushSources;
use crate::wireguard::KernelProgrammer;

#[derive(Parser, Debug)]
#[command(name = "meshnet-linux", version, about = "Cluster mesh networking daemon")]
struct Args {
    /// Config file (default: ~/.config/meshnet/config.toml, then /etc/meshnet/config.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Verbose logging (-v for debug, -vv for trace)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let cfg = config::load(args.config.as_deref()).context("could not load configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %cfg.node_id,
        directory = %cfg.directory,
        "meshnet starting"
    );

    let (prefixes_tx, prefixes_rx) = watch::channel(cfg.prefix_set());
    let (address_tx, address_rx) = watch::channel(cfg.external_address);
    let directory: Arc<dyn Directory> = Arc::new(TcpDirectory::new(cfg.directory));
    let programmer = Box::new(KernelProgrammer::new(KeyFile::new(cfg.key_path())));
    let settings = service::Settings {
        node_id: cfg.node_id.clone(),
        mesh_cidr: cfg.mesh_cidr,
        restart_delay: cfg.restart_delay(),
    };
    let cancel = CancellationToken::new();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut svc = tokio::spawn(service::run(
            cancel.clone(),
            settings,
            directory,
            programmer,
            PushSources {
                prefixes: prefixes_rx,
                address: address_rx,
            },
        ));
        let reload = Reload {
            path: args.config,
            prefixes: prefixes_tx,
            address: address_tx,
        };
        tokio::select! {
            res = &mut svc => return res.context("service task panicked")?,
            res = handle_signals(&reload) => res?,
        }
        info!("shutting down");
        cancel.cancel();
        svc.await.context("service task panicked")?
    })
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        filter = filter.add_directive(level.into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Cells refreshed from the config file on SIGHUP.
struct Reload {
    path: Option<PathBuf>,
    prefixes: watch::Sender<PrefixSet>,
    address: watch::Sender<Option<IpAddr>>,
}

impl Reload {
    fn apply(&self) {
        match config::load(self.path.as_deref()) {
            Ok(cfg) => {
                let prefixes = cfg.prefix_set();
                info!(prefixes = %prefixes, "configuration reloaded");
                self.prefixes.send_replace(prefixes);
                self.address.send_replace(cfg.external_address);
            }
            Err(e) => warn!("keeping previous prefixes, reload failed: {e}"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM, reloading prefixes on every SIGHUP.
async fn handle_signals(reload: &Reload) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = sigterm.recv() => return Ok(()),
            _ = sighup.recv() => reload.apply(),
        }
    }
}
