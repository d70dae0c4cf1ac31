//! Persistence contracts and the in-memory implementation.
//!
//! The engine only sees the traits. [`MemoryRepository`] keeps everything in
//! maps and, when opened with a path, mirrors every change into a JSON file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::allocator;
use crate::domain::{Interface, InterfaceStatus, Peer, PeerStatus, User};
use crate::error::{Result, VpnError};

/// Get-or-create mutation: receives the stored record, or `None` when it does
/// not exist yet, and returns the record to store.
pub type RepoUpdate<'a, T> = Box<dyn FnOnce(Option<T>) -> Result<T> + Send + 'a>;

/// Boxes a closure as a [`RepoUpdate`].
pub fn repo_update<'a, T, F>(f: F) -> RepoUpdate<'a, T>
where
    F: FnOnce(Option<T>) -> Result<T> + Send + 'a,
{
    Box::new(f)
}

/// Desired state of interfaces and peers.
#[async_trait]
pub trait InterfaceAndPeerRepository: Send + Sync {
    /// One interface; [`VpnError::NotFound`] when missing.
    async fn interface(&self, id: &str) -> Result<Interface>;

    /// One interface with its peers.
    async fn interface_and_peers(&self, id: &str) -> Result<(Interface, Vec<Peer>)>;

    /// All interfaces ordered by identifier.
    async fn interfaces(&self) -> Result<Vec<Interface>>;

    /// Get-or-create upsert of an interface.
    async fn save_interface(&self, id: &str, update: RepoUpdate<'_, Interface>) -> Result<Interface>;

    /// Removes an interface row. Peers are not touched.
    async fn delete_interface(&self, id: &str) -> Result<()>;

    /// Addresses of every interface.
    async fn interface_ips(&self) -> Result<Vec<IpNet>>;

    /// Interface and peer addresses grouped by the subnets they fall in.
    async fn used_ips_per_subnet(&self, subnets: &[IpNet]) -> Result<HashMap<IpNet, Vec<IpNet>>>;

    /// One peer; [`VpnError::NotFound`] when missing.
    async fn peer(&self, id: &str) -> Result<Peer>;

    /// Peers of an interface.
    async fn interface_peers(&self, interface: &str) -> Result<Vec<Peer>>;

    /// Peers owned by a user.
    async fn user_peers(&self, user: &str) -> Result<Vec<Peer>>;

    /// Get-or-create upsert of a peer.
    async fn save_peer(&self, id: &str, update: RepoUpdate<'_, Peer>) -> Result<Peer>;

    /// Removes a peer row.
    async fn delete_peer(&self, id: &str) -> Result<()>;
}

/// User records.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// One user; [`VpnError::NotFound`] when missing.
    async fn user(&self, id: &str) -> Result<User>;

    /// All users.
    async fn users(&self) -> Result<Vec<User>>;

    /// Get-or-create upsert of a user.
    async fn save_user(&self, id: &str, update: RepoUpdate<'_, User>) -> Result<User>;

    /// Removes a user row.
    async fn delete_user(&self, id: &str) -> Result<()>;
}

/// Status rows written by the statistics collector.
#[async_trait]
pub trait StatisticsRepository: Send + Sync {
    /// Status rows of the given peers; peers without a row are skipped.
    async fn peer_statuses(&self, ids: &[String]) -> Result<Vec<PeerStatus>>;

    /// Status row of an interface.
    async fn interface_status(&self, id: &str) -> Result<InterfaceStatus>;

    /// Get-or-create upsert of a peer status row.
    async fn update_peer_status(&self, id: &str, update: RepoUpdate<'_, PeerStatus>) -> Result<()>;

    /// Get-or-create upsert of an interface status row.
    async fn update_interface_status(
        &self,
        id: &str,
        update: RepoUpdate<'_, InterfaceStatus>,
    ) -> Result<()>;

    /// Removes a peer status row.
    async fn delete_peer_status(&self, id: &str) -> Result<()>;
}

/// The repositories the engine works against.
#[derive(Clone)]
pub struct Repositories {
    /// Interfaces and peers.
    pub interfaces: Arc<dyn InterfaceAndPeerRepository>,
    /// Users.
    pub users: Arc<dyn UserRepository>,
    /// Status rows.
    pub statistics: Arc<dyn StatisticsRepository>,
}

impl Repositories {
    /// Uses one backing store for every contract.
    pub fn shared<R>(repo: Arc<R>) -> Self
    where
        R: InterfaceAndPeerRepository + UserRepository + StatisticsRepository + 'static,
    {
        Self {
            interfaces: Arc::clone(&repo) as Arc<dyn InterfaceAndPeerRepository>,
            users: Arc::clone(&repo) as Arc<dyn UserRepository>,
            statistics: repo,
        }
    }
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Store {
    interfaces: BTreeMap<String, Interface>,
    peers: BTreeMap<String, Peer>,
    users: BTreeMap<String, User>,
    peer_status: BTreeMap<String, PeerStatus>,
    interface_status: BTreeMap<String, InterfaceStatus>,
}

/// Map-backed repository with an optional JSON snapshot file.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    store: RwLock<Store>,
    snapshot: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl MemoryRepository {
    /// A repository that keeps state in memory only.
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository mirrored to `path`, loading the file when it exists.
    ///
    /// # Errors
    ///
    /// Returns [`VpnError::Repository`] if the file exists but cannot be read
    /// or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = if path.exists() {
            let raw = std::fs::read(&path).map_err(|e| {
                VpnError::Repository(format!("failed to read '{}': {e}", path.display()))
            })?;
            serde_json::from_slice(&raw).map_err(|e| {
                VpnError::Repository(format!("corrupt snapshot '{}': {e}", path.display()))
            })?
        } else {
            Store::default()
        };
        debug!(path = %path.display(), interfaces = store.interfaces.len(), peers = store.peers.len(), "repository opened");
        Ok(Self {
            store: RwLock::new(store),
            snapshot: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let data = serde_json::to_vec_pretty(&*self.store.read())?;

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn upsert<T: Clone>(
        map: &mut BTreeMap<String, T>,
        id: &str,
        update: RepoUpdate<'_, T>,
    ) -> Result<T> {
        let updated = update(map.get(id).cloned())?;
        map.insert(id.to_string(), updated.clone());
        Ok(updated)
    }
}

fn not_found(kind: &str, id: &str) -> VpnError {
    VpnError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl InterfaceAndPeerRepository for MemoryRepository {
    async fn interface(&self, id: &str) -> Result<Interface> {
        self.store
            .read()
            .interfaces
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("interface", id))
    }

    async fn interface_and_peers(&self, id: &str) -> Result<(Interface, Vec<Peer>)> {
        let store = self.store.read();
        let iface = store
            .interfaces
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("interface", id))?;
        let peers = store
            .peers
            .values()
            .filter(|p| p.interface_identifier == id)
            .cloned()
            .collect();
        Ok((iface, peers))
    }

    async fn interfaces(&self) -> Result<Vec<Interface>> {
        Ok(self.store.read().interfaces.values().cloned().collect())
    }

    async fn save_interface(&self, id: &str, update: RepoUpdate<'_, Interface>) -> Result<Interface> {
        let saved = {
            let mut store = self.store.write();
            Self::upsert(&mut store.interfaces, id, update)?
        };
        self.persist().await?;
        Ok(saved)
    }

    async fn delete_interface(&self, id: &str) -> Result<()> {
        let removed = {
            let mut store = self.store.write();
            store.interface_status.remove(id);
            store.interfaces.remove(id)
        };
        if removed.is_none() {
            return Err(not_found("interface", id));
        }
        self.persist().await
    }

    async fn interface_ips(&self) -> Result<Vec<IpNet>> {
        Ok(self
            .store
            .read()
            .interfaces
            .values()
            .flat_map(|i| i.addresses.iter().copied())
            .collect())
    }

    async fn used_ips_per_subnet(&self, subnets: &[IpNet]) -> Result<HashMap<IpNet, Vec<IpNet>>> {
        let store = self.store.read();
        let addresses = store
            .interfaces
            .values()
            .flat_map(|i| i.addresses.iter().copied())
            .chain(store.peers.values().flat_map(|p| p.interface.addresses.iter().copied()));
        Ok(allocator::group_by_subnet(subnets, addresses))
    }

    async fn peer(&self, id: &str) -> Result<Peer> {
        self.store
            .read()
            .peers
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("peer", id))
    }

    async fn interface_peers(&self, interface: &str) -> Result<Vec<Peer>> {
        Ok(self
            .store
            .read()
            .peers
            .values()
            .filter(|p| p.interface_identifier == interface)
            .cloned()
            .collect())
    }

    async fn user_peers(&self, user: &str) -> Result<Vec<Peer>> {
        Ok(self
            .store
            .read()
            .peers
            .values()
            .filter(|p| p.user_identifier == user)
            .cloned()
            .collect())
    }

    async fn save_peer(&self, id: &str, update: RepoUpdate<'_, Peer>) -> Result<Peer> {
        let saved = {
            let mut store = self.store.write();
            Self::upsert(&mut store.peers, id, update)?
        };
        self.persist().await?;
        Ok(saved)
    }

    async fn delete_peer(&self, id: &str) -> Result<()> {
        let removed = {
            let mut store = self.store.write();
            store.peer_status.remove(id);
            store.peers.remove(id)
        };
        if removed.is_none() {
            return Err(not_found("peer", id));
        }
        self.persist().await
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn user(&self, id: &str) -> Result<User> {
        self.store
            .read()
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("user", id))
    }

    async fn users(&self) -> Result<Vec<User>> {
        Ok(self.store.read().users.values().cloned().collect())
    }

    async fn save_user(&self, id: &str, update: RepoUpdate<'_, User>) -> Result<User> {
        let saved = {
            let mut store = self.store.write();
            Self::upsert(&mut store.users, id, update)?
        };
        self.persist().await?;
        Ok(saved)
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        if self.store.write().users.remove(id).is_none() {
            return Err(not_found("user", id));
        }
        self.persist().await
    }
}

#[async_trait]
impl StatisticsRepository for MemoryRepository {
    async fn peer_statuses(&self, ids: &[String]) -> Result<Vec<PeerStatus>> {
        let store = self.store.read();
        Ok(ids
            .iter()
            .filter_map(|id| store.peer_status.get(id).cloned())
            .collect())
    }

    async fn interface_status(&self, id: &str) -> Result<InterfaceStatus> {
        self.store
            .read()
            .interface_status
            .get(id)
            .cloned()
            .ok_or_else(|| not_found("interface status", id))
    }

    async fn update_peer_status(&self, id: &str, update: RepoUpdate<'_, PeerStatus>) -> Result<()> {
        {
            let mut store = self.store.write();
            Self::upsert(&mut store.peer_status, id, update)?;
        }
        self.persist().await
    }

    async fn update_interface_status(
        &self,
        id: &str,
        update: RepoUpdate<'_, InterfaceStatus>,
    ) -> Result<()> {
        {
            let mut store = self.store.write();
            Self::upsert(&mut store.interface_status, id, update)?;
        }
        self.persist().await
    }

    async fn delete_peer_status(&self, id: &str) -> Result<()> {
        self.store.write().peer_status.remove(id);
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claw_wireguard::KeyPair;

    fn net(s: &str) -> IpNet {
        s.parse().expect("cidr")
    }

    fn peer_on(interface: &str, addr: &str) -> Peer {
        let mut p = Peer::new(*KeyPair::generate().public_key(), interface);
        p.interface.addresses = vec![net(addr)];
        p
    }

    #[tokio::test]
    async fn save_interface_get_or_create() {
        let repo = MemoryRepository::new();
        let created = repo
            .save_interface(
                "wg0",
                repo_update(|current: Option<Interface>| {
                    assert!(current.is_none());
                    let mut iface = Interface::new("wg0");
                    iface.listen_port = 51820;
                    Ok(iface)
                }),
            )
            .await
            .expect("create");
        assert_eq!(created.listen_port, 51820);

        repo.save_interface(
            "wg0",
            repo_update(|current: Option<Interface>| {
                let mut iface = current.expect("exists");
                iface.mtu = 1380;
                Ok(iface)
            }),
        )
        .await
        .expect("update");

        let stored = repo.interface("wg0").await.expect("stored");
        assert_eq!((stored.listen_port, stored.mtu), (51820, 1380));
    }

    #[tokio::test]
    async fn failed_update_stores_nothing() {
        let repo = MemoryRepository::new();
        let result = repo
            .save_interface(
                "wg0",
                repo_update(|_: Option<Interface>| Err(VpnError::InvalidData("nope".into()))),
            )
            .await;
        assert!(result.is_err());
        assert!(repo.interface("wg0").await.expect_err("missing").is_not_found());
    }

    #[tokio::test]
    async fn peer_queries() {
        let repo = MemoryRepository::new();
        let mut owned = peer_on("wg0", "10.0.0.2/24");
        owned.user_identifier = "alice".into();
        let other = peer_on("wg1", "10.1.0.2/24");
        for p in [owned.clone(), other.clone()] {
            let id = p.identifier.clone();
            repo.save_peer(&id, repo_update(move |_: Option<Peer>| Ok(p)))
                .await
                .expect("save");
        }

        assert_eq!(repo.interface_peers("wg0").await.expect("peers").len(), 1);
        assert_eq!(repo.user_peers("alice").await.expect("peers")[0].identifier, owned.identifier);
        repo.delete_peer(&other.identifier).await.expect("delete");
        assert!(repo.peer(&other.identifier).await.expect_err("gone").is_not_found());
        assert!(repo.delete_peer(&other.identifier).await.is_err());
    }

    #[tokio::test]
    async fn used_ips_grouped_by_subnet() {
        let repo = MemoryRepository::new();
        let mut iface = Interface::new("wg0");
        iface.addresses = vec![net("10.0.0.1/24")];
        repo.save_interface("wg0", repo_update(move |_: Option<Interface>| Ok(iface)))
            .await
            .expect("save");
        let p = peer_on("wg0", "10.0.0.2/24");
        let id = p.identifier.clone();
        repo.save_peer(&id, repo_update(move |_: Option<Peer>| Ok(p)))
            .await
            .expect("save");

        let used = repo
            .used_ips_per_subnet(&[net("10.0.0.0/24"), net("10.9.0.0/24")])
            .await
            .expect("used");
        assert_eq!(used[&net("10.0.0.0/24")].len(), 2);
        assert!(used[&net("10.9.0.0/24")].is_empty());
        assert_eq!(repo.interface_ips().await.expect("ips"), vec![net("10.0.0.1/24")]);
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state").join("vpn.json");

        let repo = MemoryRepository::open(&path).expect("open");
        repo.save_interface("wg3", repo_update(|_: Option<Interface>| Ok(Interface::new("wg3"))))
            .await
            .expect("save");
        repo.update_peer_status(
            "peer",
            repo_update(|s: Option<PeerStatus>| {
                let mut s = s.unwrap_or_else(|| PeerStatus::new("peer"));
                s.bytes_received = 42;
                Ok(s)
            }),
        )
        .await
        .expect("status");
        drop(repo);

        let reopened = MemoryRepository::open(&path).expect("reopen");
        assert_eq!(reopened.interface("wg3").await.expect("kept").identifier, "wg3");
        let statuses = reopened.peer_statuses(&["peer".to_string()]).await.expect("status");
        assert_eq!(statuses[0].bytes_received, 42);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vpn.json");
        std::fs::write(&path, b"{not json").expect("write");
        assert!(matches!(MemoryRepository::open(&path), Err(VpnError::Repository(_))));
    }
}
