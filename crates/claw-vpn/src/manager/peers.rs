use chrono::Utc;
use claw_wireguard::{Controller, KeyPair, PhysicalPeer, PresharedKey, update_fn};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Manager;
use crate::allocator;
use crate::domain::{CallerIdentity, Interface, InterfaceType, Peer, reasons};
use crate::error::{Result, VpnError};
use crate::repository::repo_update;

/// Bulk peer creation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerCreationRequest {
    /// One peer is created per entry, owned by that user identifier.
    pub user_identifiers: Vec<String>,
    /// Appended to every generated display name.
    pub suffix: String,
}

impl Manager {
    fn require_peer_access(&self, caller: &CallerIdentity, owner: &str) -> Result<()> {
        if caller.is_admin {
            return Ok(());
        }
        if !self.cfg.core.self_provisioning_allowed {
            return Err(VpnError::NoPermission(format!(
                "{} may not manage peers",
                caller.user_id
            )));
        }
        caller.require_admin_or_self(owner)
    }

    /// One peer.
    ///
    /// # Errors
    ///
    /// Admins may read any peer, users only their own.
    pub async fn get_peer(&self, caller: &CallerIdentity, id: &str) -> Result<Peer> {
        let peer = self.db.peer(id).await?;
        caller.require_admin_or_self(&peer.user_identifier)?;
        Ok(peer)
    }

    /// Peers owned by `user`.
    ///
    /// # Errors
    ///
    /// Admins may query anyone, users only themselves.
    pub async fn get_user_peers(&self, caller: &CallerIdentity, user: &str) -> Result<Vec<Peer>> {
        caller.require_admin_or_self(user)?;
        self.db.user_peers(user).await
    }

    /// A fresh, unsaved peer on `interface` owned by the caller.
    ///
    /// # Errors
    ///
    /// Admins always; users only with self-provisioning. Fails when the
    /// interface is unknown or its networks are exhausted.
    pub async fn prepare_peer(&self, caller: &CallerIdentity, interface: &str) -> Result<Peer> {
        self.require_peer_access(caller, &caller.user_id)?;
        let iface = self.db.interface(interface).await?;
        self.fresh_peer(&iface, &caller.user_id, &caller.user_id).await
    }

    async fn fresh_peer(&self, iface: &Interface, owner: &str, actor: &str) -> Result<Peer> {
        let networks = &iface.peer_defaults.network;
        let used = self.db.used_ips_per_subnet(networks).await?;
        let addresses = allocator::fresh_peer_addresses(networks, &used)?;

        let pair = KeyPair::generate();
        let mut peer = Peer::new(*pair.public_key(), iface.identifier.clone());
        peer.set_key_pair(&pair);
        peer.preshared_key = Some(PresharedKey::generate());
        peer.interface.addresses = addresses;
        peer.interface.peer_type = if iface.interface_type == InterfaceType::Client {
            InterfaceType::Server
        } else {
            InterfaceType::Client
        };
        peer.user_identifier = owner.to_string();
        peer.generate_display_name("");
        peer.apply_interface_defaults(iface);

        let now = Utc::now();
        peer.created_by = actor.to_string();
        peer.updated_by = actor.to_string();
        peer.created_at = now;
        peer.updated_at = now;
        Ok(peer)
    }

    /// Persists a new peer and adds it to the device.
    ///
    /// The identifier is always replaced by the base64 public key.
    ///
    /// # Errors
    ///
    /// [`VpnError::InvalidData`] when a supplied private key does not belong
    /// to the public key; [`VpnError::DuplicateEntry`] when the peer exists.
    pub async fn create_peer(&self, caller: &CallerIdentity, mut peer: Peer) -> Result<Peer> {
        self.require_peer_access(caller, &peer.user_identifier)?;
        let id = peer.interface.public_key.to_base64();
        self.bounded("create peer", &id, async {
            if let Some(private) = &peer.interface.private_key {
                KeyPair::from_parts(private.clone(), peer.interface.public_key).map_err(|_| {
                    VpnError::InvalidData("peer public key does not match private key".into())
                })?;
            }
            if peer.identifier != id {
                debug!(supplied = %peer.identifier, peer = %id, "peer identifier replaced by public key");
                peer.identifier.clone_from(&id);
            }
            match self.db.peer(&id).await {
                Ok(_) => return Err(VpnError::DuplicateEntry(format!("peer {id} already exists"))),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            let iface = self.db.interface(&peer.interface_identifier).await?;
            peer.created_by.clone_from(&caller.user_id);
            peer.updated_by.clone_from(&caller.user_id);

            let saved = self.save_peer(&iface, peer).await?;
            self.bus.peer_created.publish(saved.clone());
            Ok(saved)
        })
        .await
    }

    /// Creates one peer per requested user on `interface`.
    ///
    /// # Errors
    ///
    /// Admin only. Stops at the first failure; peers created before it stay.
    pub async fn create_multiple_peers(
        &self,
        caller: &CallerIdentity,
        interface: &str,
        request: &PeerCreationRequest,
    ) -> Result<Vec<Peer>> {
        caller.require_admin()?;
        let iface = self.db.interface(interface).await?;
        let mut created = Vec::with_capacity(request.user_identifiers.len());
        for user in &request.user_identifiers {
            let mut peer = self.fresh_peer(&iface, user, &caller.user_id).await?;
            if !request.suffix.is_empty() {
                peer.display_name = format!("{} {}", peer.display_name, request.suffix);
            }
            created.push(self.create_peer(caller, peer).await?);
        }
        Ok(created)
    }

    /// Applies changes to an existing peer.
    ///
    /// Users with self-provisioning only change the user-editable fields of
    /// their own peers.
    ///
    /// # Errors
    ///
    /// [`VpnError::NotFound`] for unknown peers; [`VpnError::InvalidData`]
    /// when the identifier no longer matches the key or the interface changed.
    pub async fn update_peer(&self, caller: &CallerIdentity, peer: Peer) -> Result<Peer> {
        let id = peer.identifier.clone();
        self.bounded("update peer", &id, async {
            let existing = self.db.peer(&peer.identifier).await?;
            self.require_peer_access(caller, &existing.user_identifier)?;

            let mut next = if caller.is_admin {
                peer
            } else {
                let mut merged = existing.clone();
                merged.overwrite_user_editable_fields(&peer, self.cfg.core.editable_keys);
                merged
            };
            if next.interface_identifier != existing.interface_identifier {
                return Err(VpnError::InvalidData(
                    "peer cannot move to another interface".into(),
                ));
            }
            if next.identifier != next.interface.public_key.to_base64()
                || next.identifier != existing.identifier
            {
                return Err(VpnError::InvalidData(
                    "peer identifier must stay equal to its public key".into(),
                ));
            }
            if let Some(private) = &next.interface.private_key {
                KeyPair::from_parts(private.clone(), next.interface.public_key).map_err(|_| {
                    VpnError::InvalidData("peer public key does not match private key".into())
                })?;
            }
            next.updated_by.clone_from(&caller.user_id);

            let iface = self.db.interface(&next.interface_identifier).await?;
            self.save_peer(&iface, next).await
        })
        .await
    }

    /// Removes a peer from the device and the repository.
    ///
    /// # Errors
    ///
    /// [`VpnError::NotFound`] for unknown peers.
    pub async fn delete_peer(&self, caller: &CallerIdentity, id: &str) -> Result<()> {
        self.bounded("delete peer", id, async {
            let peer = self.db.peer(id).await?;
            self.require_peer_access(caller, &peer.user_identifier)?;

            let (iface, controller) = self.controller_for(&peer.interface_identifier).await?;
            match controller
                .delete_peer(&iface.identifier, &peer.interface.public_key)
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_exist() => {}
                Err(e) => return Err(e.into()),
            }
            self.db.delete_peer(id).await?;

            self.bus.route_update.publish(iface.routing_info());
            self.bus.peer_deleted.publish(peer);
            Ok(())
        })
        .await
    }

    /// Creates a peer for `user` on every enabled server interface.
    ///
    /// Returns the number of created peers.
    ///
    /// # Errors
    ///
    /// Admin only.
    pub async fn create_default_peer(&self, caller: &CallerIdentity, user: &str) -> Result<usize> {
        caller.require_admin()?;
        let owned = self.db.user_peers(user).await?;

        let mut created = 0;
        for iface in self.db.interfaces().await? {
            if iface.is_disabled() || iface.interface_type != InterfaceType::Server {
                continue;
            }
            if owned
                .iter()
                .any(|p| p.automatically_created && p.interface_identifier == iface.identifier)
            {
                continue;
            }
            let mut peer = self.fresh_peer(&iface, user, &caller.user_id).await?;
            peer.generate_display_name("Default");
            peer.automatically_created = true;
            self.create_peer(caller, peer).await?;
            info!(interface = %iface.identifier, user, "default peer created");
            created += 1;
        }
        Ok(created)
    }

    /// Disables every enabled peer whose expiry date has passed.
    ///
    /// Returns the number of disabled peers. A peer that cannot be saved is
    /// logged and retried on the next sweep.
    ///
    /// # Errors
    ///
    /// Fails only when the interface list cannot be loaded.
    pub async fn disable_expired_peers(&self) -> Result<usize> {
        let mut disabled = 0;
        for iface in self.db.interfaces().await? {
            let peers = match self.db.interface_peers(&iface.identifier).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!(
                        interface = %iface.identifier,
                        error = %e,
                        "failed to load peers for expiry check"
                    );
                    continue;
                }
            };
            for mut peer in peers {
                if peer.is_disabled() || !peer.is_expired() {
                    continue;
                }
                peer.disable(reasons::EXPIRED);
                let id = peer.identifier.clone();
                match self.bounded("expire peer", &id, self.save_peer(&iface, peer)).await {
                    Ok(_) => {
                        info!(interface = %iface.identifier, peer = %id, "peer expired");
                        disabled += 1;
                    }
                    Err(e) => warn!(
                        interface = %iface.identifier,
                        peer = %id,
                        error = %e,
                        "failed to disable expired peer"
                    ),
                }
            }
        }
        Ok(disabled)
    }

    /// Pushes `peer` onto the device of `iface` and persists it.
    pub(super) async fn save_peer(&self, iface: &Interface, peer: Peer) -> Result<Peer> {
        let controller = self.controller(&iface.backend)?;
        self.apply_physical_peer(controller.as_ref(), iface, &peer)
            .await?;

        let now = Utc::now();
        let saved = self
            .db
            .save_peer(
                &peer.identifier.clone(),
                repo_update(move |current: Option<Peer>| {
                    let mut next = peer;
                    if let Some(old) = current {
                        next.created_at = old.created_at;
                        next.created_by = old.created_by;
                    }
                    next.updated_at = now;
                    Ok(next)
                }),
            )
            .await?;

        self.bus.route_update.publish(iface.routing_info());
        self.bus.peer_updated.publish(saved.clone());
        Ok(saved)
    }

    /// Brings the device in line with one peer: present when both the peer
    /// and its interface are enabled, absent otherwise.
    pub(super) async fn apply_physical_peer(
        &self,
        controller: &dyn Controller,
        iface: &Interface,
        peer: &Peer,
    ) -> Result<()> {
        let key = peer.interface.public_key;
        if iface.is_disabled() || peer.is_disabled() {
            return match controller.delete_peer(&iface.identifier, &key).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_not_exist() => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let desired = peer.clone();
        controller
            .save_peer(
                &iface.identifier,
                &key,
                update_fn(move |pp: &mut PhysicalPeer| {
                    desired.merge_to_physical(pp);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Harness, harness, harness_with};
    use super::*;
    use crate::config::VpnConfig;
    use chrono::Duration;
    use claw_wireguard::PrivateKey;
    use ipnet::IpNet;

    fn admin() -> CallerIdentity {
        CallerIdentity::admin("root")
    }

    async fn with_interface(h: &Harness) -> Interface {
        let iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        h.manager.create_interface(&admin(), iface).await.expect("create")
    }

    fn self_service() -> Harness {
        let mut cfg = VpnConfig::default();
        cfg.core.self_provisioning_allowed = true;
        harness_with(cfg, false)
    }

    #[tokio::test]
    async fn prepared_peer_inherits_defaults() {
        let h = harness();
        let iface = with_interface(&h).await;
        let peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");

        assert_eq!(peer.identifier, peer.interface.public_key.to_base64());
        assert_eq!(peer.interface.addresses[0], "10.11.12.2/24".parse::<IpNet>().expect("cidr"));
        assert_eq!(peer.interface.peer_type, InterfaceType::Client);
        assert_eq!(*peer.persistent_keepalive.get(), 16);
        assert_eq!(peer.allowed_ips_str.get(), &iface.peer_defaults.allowed_ips_str);
        assert!(peer.display_name.starts_with("Peer "));
        assert_eq!(peer.user_identifier, "root");
        assert!(peer.preshared_key.is_some());
    }

    #[tokio::test]
    async fn identifier_is_corrected_to_public_key() {
        let h = harness();
        let iface = with_interface(&h).await;
        let mut peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
        let key = peer.interface.public_key.to_base64();
        peer.identifier = "chosen-by-client".into();

        let saved = h.manager.create_peer(&admin(), peer).await.expect("create");
        assert_eq!(saved.identifier, key);
        assert!(h.manager.get_peer(&admin(), &key).await.is_ok());
        assert!(h.manager.get_peer(&admin(), "chosen-by-client").await.is_err());
        assert_eq!(h.device.peers(&iface.identifier).await.expect("device").len(), 1);
    }

    #[tokio::test]
    async fn mismatched_keys_are_rejected() {
        let h = harness();
        let iface = with_interface(&h).await;
        let mut peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
        peer.interface.private_key = Some(PrivateKey::generate());
        let err = h.manager.create_peer(&admin(), peer).await.expect_err("mismatch");
        assert!(matches!(err.root(), VpnError::InvalidData(_)));
        assert!(h.device.peers(&iface.identifier).await.expect("device").is_empty());
    }

    #[tokio::test]
    async fn duplicate_peer_is_rejected() {
        let h = harness();
        let iface = with_interface(&h).await;
        let peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
        h.manager.create_peer(&admin(), peer.clone()).await.expect("create");
        let err = h.manager.create_peer(&admin(), peer).await.expect_err("duplicate");
        assert!(matches!(err.root(), VpnError::DuplicateEntry(_)));
    }

    #[tokio::test]
    async fn users_need_self_provisioning() {
        let h = harness();
        let iface = with_interface(&h).await;
        let alice = CallerIdentity::user("alice");
        let err = h.manager.prepare_peer(&alice, &iface.identifier).await.expect_err("denied");
        assert!(matches!(err.root(), VpnError::NoPermission(_)));

        let h = self_service();
        let iface = with_interface(&h).await;
        let peer = h.manager.prepare_peer(&alice, &iface.identifier).await.expect("prepare");
        assert_eq!(peer.user_identifier, "alice");
        let peer = h.manager.create_peer(&alice, peer).await.expect("create own");

        let mut foreign = h.manager.prepare_peer(&alice, &iface.identifier).await.expect("prepare");
        foreign.user_identifier = "bob".into();
        assert!(h.manager.create_peer(&alice, foreign).await.is_err());

        let bob = CallerIdentity::user("bob");
        assert!(h.manager.delete_peer(&bob, &peer.identifier).await.is_err());
        h.manager.delete_peer(&alice, &peer.identifier).await.expect("delete own");
    }

    #[tokio::test]
    async fn user_update_only_touches_editable_fields() {
        let h = self_service();
        let iface = with_interface(&h).await;
        let alice = CallerIdentity::user("alice");
        let peer = h.manager.prepare_peer(&alice, &iface.identifier).await.expect("prepare");
        let peer = h.manager.create_peer(&alice, peer).await.expect("create");

        let mut edit = peer.clone();
        edit.display_name = "Laptop".into();
        edit.notes = "not editable".into();
        let saved = h.manager.update_peer(&alice, edit).await.expect("update");
        assert_eq!(saved.display_name, "Laptop");
        assert!(saved.notes.is_empty());
        assert_eq!(saved.created_at, peer.created_at);
    }

    #[tokio::test]
    async fn update_cannot_move_peer() {
        let h = harness();
        let iface = with_interface(&h).await;
        let peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("prepare");
        let mut peer = h.manager.create_peer(&admin(), peer).await.expect("create");
        peer.interface_identifier = "wg42".into();
        let err = h.manager.update_peer(&admin(), peer).await.expect_err("moved");
        assert!(matches!(err.root(), VpnError::InvalidData(_)));
    }

    #[tokio::test]
    async fn disabling_a_peer_removes_it_from_device() {
        let h = harness();
        let iface = with_interface(&h).await;
        let peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("prepare");
        let mut peer = h.manager.create_peer(&admin(), peer).await.expect("create");
        peer.disable(reasons::ADMIN_DISABLED);
        h.manager.update_peer(&admin(), peer).await.expect("update");
        assert!(h.device.peers(&iface.identifier).await.expect("device").is_empty());
    }

    #[tokio::test]
    async fn multiple_peers_get_distinct_addresses() {
        let h = harness();
        let iface = with_interface(&h).await;
        let request = PeerCreationRequest {
            user_identifiers: vec!["alice".into(), "bob".into(), "carol".into()],
            suffix: "(bulk)".into(),
        };
        let peers = h
            .manager
            .create_multiple_peers(&admin(), &iface.identifier, &request)
            .await
            .expect("bulk");
        assert_eq!(peers.len(), 3);
        assert!(peers[1].display_name.ends_with(" (bulk)"));
        assert_eq!(peers[2].user_identifier, "carol");
        let mut addrs: Vec<_> = peers.iter().map(|p| p.interface.addresses[0]).collect();
        addrs.dedup();
        assert_eq!(addrs.len(), 3);
    }

    #[tokio::test]
    async fn default_peers_only_on_enabled_servers() {
        let h = harness();
        let server = with_interface(&h).await;
        let mut client = h.manager.prepare_interface(&admin()).await.expect("prepare");
        client.interface_type = InterfaceType::Client;
        h.manager.create_interface(&admin(), client).await.expect("client");

        let n = h.manager.create_default_peer(&admin(), "dave").await.expect("default");
        assert_eq!(n, 1);
        let again = h.manager.create_default_peer(&admin(), "dave").await.expect("default");
        assert_eq!(again, 0);

        let peers = h.manager.get_user_peers(&admin(), "dave").await.expect("peers");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].interface_identifier, server.identifier);
        assert!(peers[0].display_name.starts_with("Default Peer "));
    }

    #[tokio::test]
    async fn expired_peers_are_disabled() {
        let h = harness();
        let iface = with_interface(&h).await;
        let mut peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("prepare");
        peer.expires_at = Some(Utc::now() - Duration::hours(1));
        let peer = h.manager.create_peer(&admin(), peer).await.expect("create");
        let fresh = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("prepare");
        h.manager.create_peer(&admin(), fresh).await.expect("create");

        assert_eq!(h.manager.disable_expired_peers().await.expect("sweep"), 1);
        let stored = h.manager.get_peer(&admin(), &peer.identifier).await.expect("peer");
        assert_eq!(stored.disabled_reason, reasons::EXPIRED);
        assert_eq!(h.device.peers(&iface.identifier).await.expect("device").len(), 1);
        assert_eq!(h.manager.disable_expired_peers().await.expect("sweep"), 0);
    }

    #[tokio::test]
    async fn expiry_sweep_continues_past_failing_peer() {
        let h = harness();
        let mut expired = Vec::new();
        for _ in 0..2 {
            let iface = with_interface(&h).await;
            let mut peer =
                h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("prepare");
            peer.expires_at = Some(Utc::now() - Duration::hours(1));
            expired.push(h.manager.create_peer(&admin(), peer).await.expect("create"));
        }
        h.device.fail_saves_for(&expired[0].interface_identifier);

        assert_eq!(h.manager.disable_expired_peers().await.expect("sweep"), 1);
        let stuck = h.manager.get_peer(&admin(), &expired[0].identifier).await.expect("peer");
        assert!(!stuck.is_disabled());
        let done = h.manager.get_peer(&admin(), &expired[1].identifier).await.expect("peer");
        assert_eq!(done.disabled_reason, reasons::EXPIRED);
    }
}
