//! In-process controller.
//!
//! Keeps physical interfaces and peers in memory. Used as a dry-run backend
//! and as the device double in engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::controller::{Controller, PeerSetReplacer, UpdateFn};
use crate::error::{Result, WireGuardError};
use crate::keys::PublicKey;
use crate::types::{BackendKind, PhysicalInterface, PhysicalPeer, PingResult};

#[derive(Debug, Default)]
struct Device {
    interface: PhysicalInterface,
    peers: BTreeMap<PublicKey, PhysicalPeer>,
}

#[derive(Debug, Default)]
struct State {
    devices: BTreeMap<String, Device>,
    pingable: HashSet<String>,
    failing: HashSet<String>,
}

/// Controller backed by a shared in-memory map.
#[derive(Debug, Clone)]
pub struct MemoryController {
    id: String,
    state: Arc<RwLock<State>>,
    bulk_replace: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryController {
    /// Creates an empty controller registered under `id`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(RwLock::new(State::default())),
            bulk_replace: Arc::new(AtomicBool::new(false)),
            saves: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Enables or disables the bulk peer replacement capability.
    #[must_use]
    pub fn with_bulk_replace(self, enabled: bool) -> Self {
        self.bulk_replace.store(enabled, Ordering::SeqCst);
        self
    }

    /// Places an interface on the "device" directly, bypassing the save path.
    pub fn insert_interface(&self, mut interface: PhysicalInterface) {
        interface.import_source = BackendKind::Memory;
        let mut state = self.state.write();
        let device = state.devices.entry(interface.identifier.clone()).or_default();
        device.interface = interface;
    }

    /// Places a peer on an existing interface directly.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::InterfaceNotFound`] if the interface is absent.
    pub fn insert_peer(&self, interface: &str, mut peer: PhysicalPeer) -> Result<()> {
        peer.import_source = BackendKind::Memory;
        let mut state = self.state.write();
        let device = state
            .devices
            .get_mut(interface)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(interface.to_string()))?;
        device.peers.insert(peer.public_key, peer);
        Ok(())
    }

    /// Marks `address` as answering pings.
    pub fn set_pingable(&self, address: &str, pingable: bool) {
        let mut state = self.state.write();
        if pingable {
            state.pingable.insert(address.to_string());
        } else {
            state.pingable.remove(address);
        }
    }

    /// Makes every save and peer removal against `interface` fail with an
    /// interface error.
    pub fn fail_saves_for(&self, interface: &str) {
        self.state.write().failing.insert(interface.to_string());
    }

    /// Number of successful save calls so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Names of the interfaces currently present.
    #[must_use]
    pub fn interface_names(&self) -> Vec<String> {
        self.state.read().devices.keys().cloned().collect()
    }

    fn check_failing(state: &State, interface: &str) -> Result<()> {
        if state.failing.contains(interface) {
            return Err(WireGuardError::InterfaceError(format!(
                "device refused changes to {interface}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Controller for MemoryController {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn interfaces(&self) -> Result<Vec<PhysicalInterface>> {
        let state = self.state.read();
        Ok(state.devices.values().map(|d| d.interface.clone()).collect())
    }

    async fn interface(&self, id: &str) -> Result<PhysicalInterface> {
        let state = self.state.read();
        state
            .devices
            .get(id)
            .map(|d| d.interface.clone())
            .ok_or_else(|| WireGuardError::InterfaceNotFound(id.to_string()))
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PhysicalPeer>> {
        let state = self.state.read();
        let device = state
            .devices
            .get(interface)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(interface.to_string()))?;
        Ok(device.peers.values().cloned().collect())
    }

    async fn peer(&self, interface: &str, peer: &PublicKey) -> Result<PhysicalPeer> {
        let state = self.state.read();
        let device = state
            .devices
            .get(interface)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(interface.to_string()))?;
        device
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| WireGuardError::PeerNotFound {
                interface: interface.to_string(),
                peer: peer.to_base64(),
            })
    }

    async fn save_interface(&self, id: &str, update: UpdateFn<'_, PhysicalInterface>) -> Result<()> {
        let mut state = self.state.write();
        Self::check_failing(&state, id)?;

        let mut current = match state.devices.get(id) {
            Some(device) => device.interface.clone(),
            None => {
                debug!(interface = %id, "creating in-memory interface");
                let mut fresh = PhysicalInterface::new(id);
                fresh.import_source = BackendKind::Memory;
                fresh.device_type = "memory".to_string();
                fresh
            }
        };
        update(&mut current)?;
        current.identifier = id.to_string();

        let device = state.devices.entry(id.to_string()).or_default();
        device.interface = current;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_interface(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        if state.devices.remove(id).is_none() {
            return Err(WireGuardError::InterfaceNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn save_peer(
        &self,
        interface: &str,
        peer: &PublicKey,
        update: UpdateFn<'_, PhysicalPeer>,
    ) -> Result<()> {
        let mut state = self.state.write();
        Self::check_failing(&state, interface)?;
        let device = state
            .devices
            .get_mut(interface)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(interface.to_string()))?;

        let mut current = device.peers.get(peer).cloned().unwrap_or_else(|| {
            let mut fresh = PhysicalPeer::new(*peer);
            fresh.import_source = BackendKind::Memory;
            fresh
        });
        update(&mut current)?;
        current.public_key = *peer;
        device.peers.insert(*peer, current);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_peer(&self, interface: &str, peer: &PublicKey) -> Result<()> {
        let mut state = self.state.write();
        Self::check_failing(&state, interface)?;
        if let Some(device) = state.devices.get_mut(interface) {
            device.peers.remove(peer);
        }
        Ok(())
    }

    async fn ping(&self, address: &str) -> Result<PingResult> {
        let recv = u32::from(self.state.read().pingable.contains(address));
        Ok(PingResult {
            packets_sent: 1,
            packets_recv: recv,
            rtts: Vec::new(),
        })
    }

    fn peer_replacer(&self) -> Option<&dyn PeerSetReplacer> {
        if self.bulk_replace.load(Ordering::SeqCst) {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl PeerSetReplacer for MemoryController {
    async fn replace_peers(&self, interface: &str, peers: Vec<PhysicalPeer>) -> Result<()> {
        let mut state = self.state.write();
        let device = state
            .devices
            .get_mut(interface)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(interface.to_string()))?;
        let replaced: HashMap<_, _> = peers.into_iter().map(|p| (p.public_key, p)).collect();
        device.peers = replaced.into_iter().collect();
        Ok(())
    }
}
