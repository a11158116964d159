//! Kernel-backed peer programming: the `clusternet` WireGuard interface, its
//! peers and the mesh route.

use std::io;
use std::process::Command;

use ipnet::IpNet;
use meshnet_core::programmer::{DEVICE_NAME, ROUTE_PROTOCOL, WIREGUARD_PORT};
use meshnet_core::{Keypair, NodeRecord, Peer, PeerProgrammer, ProgrammerError, PublicKey};
use tracing::{debug, info};
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

use crate::keyfile::KeyFile;

pub struct KernelProgrammer {
    keyfile: KeyFile,
    keypair: Option<Keypair>,
    iface: Option<InterfaceName>,
}

impl KernelProgrammer {
    pub fn new(keyfile: KeyFile) -> Self {
        Self {
            keyfile,
            keypair: None,
            iface: None,
        }
    }

    fn iface(&self) -> Result<&InterfaceName, ProgrammerError> {
        self.iface.as_ref().ok_or(ProgrammerError::NotSetUp)
    }
}

fn kernel(op: &'static str) -> impl FnOnce(io::Error) -> ProgrammerError {
    move |source| ProgrammerError::Kernel { op, source }
}

fn wg_key(key: &PublicKey) -> Result<Key, ProgrammerError> {
    Key::from_base64(&key.to_base64()).map_err(|_| ProgrammerError::Kernel {
        op: "converting key",
        source: io::Error::new(io::ErrorKind::InvalidData, "key rejected by wireguard-control"),
    })
}

/// Run `ip` with the given arguments, turning a non-zero exit into an error
/// carrying its stderr.
fn ip(op: &'static str, args: &[&str]) -> Result<(), ProgrammerError> {
    let out = Command::new("ip").args(args).output().map_err(kernel(op))?;
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    Err(ProgrammerError::Kernel {
        op,
        source: io::Error::new(io::ErrorKind::Other, stderr),
    })
}

impl PeerProgrammer for KernelProgrammer {
    fn ensure_key(&mut self) -> Result<(), ProgrammerError> {
        if self.keypair.is_none() {
            self.keypair = Some(self.keyfile.load_or_create()?);
        }
        Ok(())
    }

    fn setup(&mut self, mesh_cidr: IpNet) -> Result<(), ProgrammerError> {
        let keypair = self.keypair.as_ref().ok_or(ProgrammerError::NoKey)?;
        let iface: InterfaceName = DEVICE_NAME.parse().map_err(|_| ProgrammerError::Kernel {
            op: "parsing interface name",
            source: io::Error::new(io::ErrorKind::InvalidInput, DEVICE_NAME),
        })?;

        // Start from a clean interface; peers from a previous run are
        // reprogrammed by the next full resync.
        let existing = Device::list(Backend::Kernel).map_err(kernel("listing interfaces"))?;
        if existing.iter().any(|name| *name == iface) {
            debug!(device = DEVICE_NAME, "removing existing interface");
            Device::get(&iface, Backend::Kernel)
                .and_then(|dev| dev.delete())
                .map_err(kernel("removing existing interface"))?;
        }

        ip(
            "adding interface",
            &["link", "add", "dev", DEVICE_NAME, "type", "wireguard"],
        )?;

        let private = Key::from_base64(&keypair.private_base64()).map_err(|_| {
            ProgrammerError::Kernel {
                op: "converting private key",
                source: io::Error::new(io::ErrorKind::InvalidData, "key rejected by wireguard-control"),
            }
        })?;
        DeviceUpdate::new()
            .set_private_key(private)
            .set_listen_port(WIREGUARD_PORT)
            .apply(&iface, Backend::Kernel)
            .map_err(kernel("configuring device"))?;

        ip("bringing interface up", &["link", "set", "dev", DEVICE_NAME, "up"])?;

        let cidr = mesh_cidr.trunc().to_string();
        let proto = ROUTE_PROTOCOL.to_string();
        ip(
            "installing mesh route",
            &["route", "replace", &cidr, "dev", DEVICE_NAME, "proto", &proto],
        )?;

        info!(device = DEVICE_NAME, port = WIREGUARD_PORT, route = %cidr, "interface ready");
        self.iface = Some(iface);
        Ok(())
    }

    fn configure_peers(&mut self, nodes: &[NodeRecord]) -> Result<(), ProgrammerError> {
        let local = self
            .keypair
            .as_ref()
            .ok_or(ProgrammerError::NoKey)?
            .public_key()
            .to_base64();
        let iface = self.iface()?;

        let mut peers = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.public_key == local {
                continue;
            }
            let peer = Peer::from_node(node)?;
            let mut builder = PeerConfigBuilder::new(&wg_key(&peer.public_key)?)
                .set_endpoint(peer.endpoint)
                .replace_allowed_ips();
            for net in &peer.allowed_ips {
                builder = builder.add_allowed_ip(net.addr(), net.prefix_len());
            }
            peers.push(builder);
        }
        if peers.is_empty() {
            return Ok(());
        }

        DeviceUpdate::new()
            .add_peers(&peers)
            .apply(iface, Backend::Kernel)
            .map_err(kernel("configuring peers"))
    }

    fn unconfigure_peer(&mut self, node: &NodeRecord) -> Result<(), ProgrammerError> {
        let key = meshnet_core::programmer::parse_peer_key(node)?;
        let iface = self.iface()?;
        DeviceUpdate::new()
            .remove_peer_by_key(&wg_key(&key)?)
            .apply(iface, Backend::Kernel)
            .map_err(kernel("removing peer"))
    }

    fn key(&self) -> Option<Keypair> {
        self.keypair.clone()
    }

    fn close(&mut self) {
        // wireguard-control opens a netlink socket per call, so the only
        // handle held here is the interface name.
        self.iface = None;
    }
}
