//! Kernel `WireGuard` controller.
//!
//! Device configuration goes through `defguard_wireguard_rs`; links and
//! addresses go through [`NetlinkOps`].

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use defguard_wireguard_rs::host::{Host, Peer as DgPeer};
use defguard_wireguard_rs::key::Key;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{InterfaceConfiguration, Kernel, WGApi, WireguardInterfaceApi};
use ipnet::IpNet;
use tracing::{debug, info};

use crate::command;
use crate::controller::{Controller, PeerSetReplacer, UpdateFn};
use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::locks::ObjectLocks;
use crate::netlink::NetlinkOps;
use crate::ping;
use crate::registry::LOCAL_BACKEND_ID;
use crate::types::{BackendKind, LocalPeerExtras, PeerExtras, PhysicalInterface, PhysicalPeer, PingResult};

const WG_TIMEOUT: Duration = Duration::from_secs(5);

fn api(name: &str) -> Result<WGApi<Kernel>> {
    WGApi::<Kernel>::new(name.to_string())
        .map_err(|e| WireGuardError::InterfaceError(format!("WGApi::new: {e}")))
}

fn read_host(name: &str) -> Result<Host> {
    api(name)?
        .read_interface_data()
        .map_err(|_| WireGuardError::InterfaceNotFound(name.to_string()))
}

async fn read_fwmark(name: &str) -> Result<u32> {
    let out = command::run("wg", &["show", name, "fwmark"], &[], WG_TIMEOUT).await?;
    Ok(parse_fwmark(&out))
}

/// Parses `wg show <iface> fwmark` output: `off`, `0x4e21` or decimal.
fn parse_fwmark(out: &str) -> u32 {
    let value = out.trim();
    value
        .strip_prefix("0x")
        .map_or_else(|| value.parse().ok(), |hex| u32::from_str_radix(hex, 16).ok())
        .unwrap_or(0)
}

fn to_dg_key(bytes: &[u8; 32]) -> Result<Key> {
    Key::try_from(bytes.as_slice())
        .map_err(|e| WireGuardError::InvalidKey(format!("defguard key conversion: {e}")))
}

fn to_ip_addr_mask(net: &IpNet) -> Result<IpAddrMask> {
    IpAddrMask::from_str(&net.to_string())
        .map_err(|e| WireGuardError::InvalidCidr(format!("{net}: {e}")))
}

fn from_dg_peer(peer: &DgPeer) -> PhysicalPeer {
    let mut model = PhysicalPeer::new(PublicKey::from_bytes_array(peer.public_key.as_array()));
    model.endpoint = peer.endpoint.map(|e| e.to_string()).unwrap_or_default();
    model.allowed_ips = peer
        .allowed_ips
        .iter()
        .filter_map(|a| a.to_string().parse().ok())
        .collect();
    model.preshared_key = peer
        .preshared_key
        .as_ref()
        .map(|k| PresharedKey::from_bytes_array(k.as_array()));
    model.persistent_keepalive = peer.persistent_keepalive_interval.unwrap_or(0);
    model.last_handshake = peer
        .last_handshake
        .filter(|t| *t > std::time::UNIX_EPOCH)
        .map(DateTime::<Utc>::from);
    model.protocol_version = peer.protocol_version.unwrap_or(1);
    model.bytes_upload = peer.rx_bytes;
    model.bytes_download = peer.tx_bytes;
    model.import_source = BackendKind::Local;
    // the kernel never keeps disabled peers
    model.extras = Some(PeerExtras::Local(LocalPeerExtras { disabled: false }));
    model
}

async fn to_dg_peer(peer: &PhysicalPeer) -> Result<DgPeer> {
    let mut dg = DgPeer::new(to_dg_key(peer.public_key.as_bytes())?);
    if !peer.endpoint.is_empty() {
        dg.endpoint = tokio::net::lookup_host(peer.endpoint.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next());
    }
    if peer.persistent_keepalive > 0 {
        dg.persistent_keepalive_interval = Some(peer.persistent_keepalive);
    }
    if let Some(psk) = &peer.preshared_key {
        dg.preshared_key = Some(to_dg_key(psk.as_bytes())?);
    }
    for net in &peer.allowed_ips {
        dg.allowed_ips.push(to_ip_addr_mask(net)?);
    }
    Ok(dg)
}

/// Controller for kernel `WireGuard` devices on this host.
pub struct LocalController {
    netlink: Arc<dyn NetlinkOps>,
    ignored: HashSet<String>,
    locks: ObjectLocks,
}

impl LocalController {
    /// Creates a controller that skips the `ignored` interface names.
    #[must_use]
    pub fn new(netlink: Arc<dyn NetlinkOps>, ignored: impl IntoIterator<Item = String>) -> Self {
        Self {
            netlink,
            ignored: ignored.into_iter().collect(),
            locks: ObjectLocks::new(),
        }
    }

    async fn read_interface(&self, name: &str) -> Result<PhysicalInterface> {
        let link = self.netlink.link_by_name(name).await?;
        let host = read_host(name)?;

        let mut iface = PhysicalInterface::new(name);
        if let Some(key) = &host.private_key {
            let private = PrivateKey::from_bytes_array(key.as_array());
            iface.public_key = Some(private.public_key());
            iface.private_key = Some(private);
        }
        iface.listen_port = u16::try_from(host.listen_port).unwrap_or(0);
        iface.firewall_mark = read_fwmark(name).await?;
        iface.addresses = self.netlink.addr_list(link.index).await?;
        iface.mtu = link.mtu;
        iface.device_up = link.up;
        iface.import_source = BackendKind::Local;
        iface.device_type = "kernel".to_string();
        iface.bytes_upload = link.tx_bytes;
        iface.bytes_download = link.rx_bytes;
        Ok(iface)
    }

    async fn apply_interface(&self, pi: &PhysicalInterface, host: &Host) -> Result<()> {
        let link = self.netlink.link_by_name(&pi.identifier).await?;

        let private = pi
            .private_key
            .as_ref()
            .ok_or_else(|| WireGuardError::InvalidKey("interface has no private key".into()))?;
        let addresses = pi
            .addresses
            .iter()
            .map(to_ip_addr_mask)
            .collect::<Result<Vec<_>>>()?;
        let config = InterfaceConfiguration {
            name: pi.identifier.clone(),
            prvkey: private.to_base64(),
            addresses,
            port: pi.listen_port.into(),
            peers: host.peers.values().cloned().collect(),
            mtu: (pi.mtu != 0).then_some(pi.mtu),
        };
        api(&pi.identifier)?
            .configure_interface(&config)
            .map_err(|e| WireGuardError::InterfaceError(format!("configure_interface: {e}")))?;

        if read_fwmark(&pi.identifier).await? != pi.firewall_mark {
            self.set_fwmark(&pi.identifier, pi.firewall_mark).await?;
        }

        let current = self.netlink.addr_list(link.index).await?;
        for addr in &pi.addresses {
            if !current.contains(addr) {
                self.netlink.addr_add(link.index, *addr).await?;
            }
        }
        for addr in current.iter().filter(|a| !pi.addresses.contains(a)) {
            debug!(interface = %pi.identifier, address = %addr, "removing stale address");
            self.netlink.addr_del(link.index, *addr).await?;
        }

        let mtu = (pi.mtu != 0).then_some(pi.mtu);
        self.netlink.link_set(link.index, pi.device_up, mtu).await
    }

    async fn set_fwmark(&self, name: &str, mark: u32) -> Result<()> {
        let value = if mark == 0 { "off".to_string() } else { mark.to_string() };
        debug!(interface = %name, fwmark = %value, "updating firewall mark");
        command::run("wg", &["set", name, "fwmark", &value], &[], WG_TIMEOUT).await?;
        Ok(())
    }

    fn find_peer(host: &Host, interface: &str, peer: &PublicKey) -> Result<PhysicalPeer> {
        let key = to_dg_key(peer.as_bytes())?;
        host.peers
            .get(&key)
            .map(from_dg_peer)
            .ok_or_else(|| WireGuardError::PeerNotFound {
                interface: interface.to_string(),
                peer: peer.to_base64(),
            })
    }

    fn remove_peer(interface: &str, peer: &PublicKey) -> Result<()> {
        let key = to_dg_key(peer.as_bytes())?;
        api(interface)?
            .remove_peer(&key)
            .map_err(|e| WireGuardError::InterfaceError(format!("remove_peer: {e}")))
    }
}

#[async_trait]
impl Controller for LocalController {
    fn id(&self) -> &str {
        LOCAL_BACKEND_ID
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn interfaces(&self) -> Result<Vec<PhysicalInterface>> {
        let mut out = Vec::new();
        for link in self.netlink.link_list().await? {
            if !link.is_wireguard() || self.ignored.contains(&link.name) {
                continue;
            }
            out.push(self.read_interface(&link.name).await?);
        }
        Ok(out)
    }

    async fn interface(&self, id: &str) -> Result<PhysicalInterface> {
        self.read_interface(id).await
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PhysicalPeer>> {
        let host = read_host(interface)?;
        Ok(host.peers.values().map(from_dg_peer).collect())
    }

    async fn peer(&self, interface: &str, peer: &PublicKey) -> Result<PhysicalPeer> {
        let host = read_host(interface)?;
        Self::find_peer(&host, interface, peer)
    }

    async fn save_interface(&self, id: &str, update: UpdateFn<'_, PhysicalInterface>) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let mut pi = match self.read_interface(id).await {
            Ok(pi) => pi,
            Err(e) if e.is_not_exist() => {
                info!(interface = %id, "creating kernel interface");
                self.netlink.link_add_wireguard(id).await?;
                self.read_interface(id).await?
            }
            Err(e) => return Err(e),
        };
        update(&mut pi)?;
        let host = read_host(id)?;
        self.apply_interface(&pi, &host).await
    }

    async fn delete_interface(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        match self.netlink.link_by_name(id).await {
            Ok(link) => self.netlink.link_del(link.index).await,
            Err(e) if e.is_not_exist() => Ok(()),
            Err(e) => Err(e),
        }?;
        self.locks.forget(id);
        Ok(())
    }

    async fn save_peer(
        &self,
        interface: &str,
        peer: &PublicKey,
        update: UpdateFn<'_, PhysicalPeer>,
    ) -> Result<()> {
        let key = ObjectLocks::peer_key(interface, &peer.to_base64());
        let _guard = self.locks.lock(&key).await;

        let host = read_host(interface)?;
        let mut pp = match Self::find_peer(&host, interface, peer) {
            Ok(pp) => pp,
            Err(e) if e.is_not_exist() => PhysicalPeer::new(*peer),
            Err(e) => return Err(e),
        };
        update(&mut pp)?;
        pp.public_key = *peer;

        if pp.local_extras().is_some_and(|e| e.disabled) {
            debug!(interface = %interface, peer = %peer, "peer disabled, removing from device");
            return Self::remove_peer(interface, peer);
        }

        let dg = to_dg_peer(&pp).await?;
        api(interface)?
            .configure_peer(&dg)
            .map_err(|e| WireGuardError::InterfaceError(format!("configure_peer: {e}")))
    }

    async fn delete_peer(&self, interface: &str, peer: &PublicKey) -> Result<()> {
        let key = ObjectLocks::peer_key(interface, &peer.to_base64());
        let guard = self.locks.lock(&key).await;
        let outcome = read_host(interface).and_then(|host| {
            if Self::find_peer(&host, interface, peer).is_err() {
                return Ok(());
            }
            Self::remove_peer(interface, peer)
        });
        drop(guard);
        self.locks.forget(&key);
        outcome
    }

    async fn ping(&self, address: &str) -> Result<PingResult> {
        ping::ping_once(address).await
    }

    fn peer_replacer(&self) -> Option<&dyn PeerSetReplacer> {
        Some(self)
    }
}

#[async_trait]
impl PeerSetReplacer for LocalController {
    async fn replace_peers(&self, interface: &str, peers: Vec<PhysicalPeer>) -> Result<()> {
        let _guard = self.locks.lock(interface).await;
        let host = read_host(interface)?;

        let mut desired = HashMap::new();
        for peer in &peers {
            let dg = to_dg_peer(peer).await?;
            desired.insert(dg.public_key.clone(), dg);
        }
        let wg = api(interface)?;
        for key in host.peers.keys().filter(|k| !desired.contains_key(*k)) {
            wg.remove_peer(key)
                .map_err(|e| WireGuardError::InterfaceError(format!("remove_peer: {e}")))?;
        }
        for dg in desired.values() {
            wg.configure_peer(dg)
                .map_err(|e| WireGuardError::InterfaceError(format!("configure_peer: {e}")))?;
        }
        info!(interface = %interface, peers = desired.len(), "replaced kernel peer set");
        Ok(())
    }
}
