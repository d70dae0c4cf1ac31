//! The capability interface every device backend implements.

use async_trait::async_trait;

use crate::error::Result;
use crate::keys::PublicKey;
use crate::types::{BackendKind, PhysicalInterface, PhysicalPeer, PingResult};

/// Mutation applied to a physical record inside a save call.
///
/// The controller hands the closure the current record, or a default one when
/// the object does not exist yet, and writes back whatever the closure leaves.
pub type UpdateFn<'a, T> = Box<dyn FnOnce(&mut T) -> Result<()> + Send + 'a>;

/// Boxes a closure as an [`UpdateFn`].
pub fn update_fn<'a, T, F>(f: F) -> UpdateFn<'a, T>
where
    F: FnOnce(&mut T) -> Result<()> + Send + 'a,
{
    Box::new(f)
}

/// Uniform access to one backend's physical interfaces and peers.
///
/// `save_*` calls are get-or-create upserts and must be idempotent. Errors for
/// a missing object report `true` from [`crate::WireGuardError::is_not_exist`].
/// Implementations serialize concurrent saves to the same object.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Backend identifier this controller was registered under.
    fn id(&self) -> &str;

    /// Backend family.
    fn kind(&self) -> BackendKind;

    /// All interfaces the backend manages.
    async fn interfaces(&self) -> Result<Vec<PhysicalInterface>>;

    /// One interface by name.
    async fn interface(&self, id: &str) -> Result<PhysicalInterface>;

    /// All peers of an interface.
    async fn peers(&self, interface: &str) -> Result<Vec<PhysicalPeer>>;

    /// One peer of an interface.
    async fn peer(&self, interface: &str, peer: &PublicKey) -> Result<PhysicalPeer>;

    /// Creates the interface if needed, then applies `update`.
    async fn save_interface(&self, id: &str, update: UpdateFn<'_, PhysicalInterface>) -> Result<()>;

    /// Removes the interface from the device.
    async fn delete_interface(&self, id: &str) -> Result<()>;

    /// Creates the peer if needed, then applies `update`.
    async fn save_peer(
        &self,
        interface: &str,
        peer: &PublicKey,
        update: UpdateFn<'_, PhysicalPeer>,
    ) -> Result<()>;

    /// Removes the peer. Removing a missing peer is not an error.
    async fn delete_peer(&self, interface: &str, peer: &PublicKey) -> Result<()>;

    /// Sends a single ICMP echo to `address` from the backend's vantage point.
    async fn ping(&self, address: &str) -> Result<PingResult>;

    /// Bulk peer replacement, when the backend supports it.
    fn peer_replacer(&self) -> Option<&dyn PeerSetReplacer> {
        None
    }
}

/// Optional capability: atomically replace an interface's whole peer set.
#[async_trait]
pub trait PeerSetReplacer: Send + Sync {
    /// Replaces every peer on `interface` with `peers`.
    async fn replace_peers(&self, interface: &str, peers: Vec<PhysicalPeer>) -> Result<()>;

    /// Removes every peer on `interface`.
    async fn clear_peers(&self, interface: &str) -> Result<()> {
        self.replace_peers(interface, Vec::new()).await
    }
}
