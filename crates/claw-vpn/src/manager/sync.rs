use std::collections::HashSet;

use claw_wireguard::{PhysicalPeer, PublicKey};
use tracing::{debug, error, info, warn};

use super::Manager;
use crate::domain::{CallerIdentity, Interface, Peer, reasons};
use crate::error::{Result, ResultExt, VpnError};
use crate::repository::repo_update;

impl Manager {
    /// Makes every device match the repository.
    ///
    /// Missing interfaces are created, existing ones get their stored state.
    /// Peers of disabled interfaces, disabled peers and peers unknown to the
    /// repository are removed from the device. A failing interface is logged
    /// and the sweep moves on; with `update_db_on_error` an interface that
    /// could not be created is stored as disabled.
    ///
    /// # Errors
    ///
    /// Admin only. Fails only when the interface list cannot be loaded.
    pub async fn restore_interface_state(
        &self,
        caller: &CallerIdentity,
        update_db_on_error: bool,
        filter: &[String],
    ) -> Result<()> {
        caller.require_admin()?;
        for iface in self.db.interfaces().await? {
            if !filter.is_empty() && !filter.contains(&iface.identifier) {
                continue;
            }
            let id = iface.identifier.clone();
            let outcome = self
                .bounded("restore interface", &id, self.restore_one(iface, update_db_on_error))
                .await;
            if let Err(e) = outcome {
                warn!(interface = %id, error = %e, "failed to restore interface state");
            }
        }
        Ok(())
    }

    async fn restore_one(&self, iface: Interface, update_db_on_error: bool) -> Result<()> {
        let id = iface.identifier.clone();
        let controller = self.controller(&iface.backend)?;
        let peers = self.db.interface_peers(&id).await?;

        let physical = match controller.interface(&id).await {
            Ok(pi) => Some(pi),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e.into()),
        };

        let saved = match physical {
            Some(pi) if !iface.differs_from_physical(&pi) => {
                debug!(interface = %id, "device already matches stored interface");
                iface
            }
            Some(_) => {
                debug!(interface = %id, disabled = iface.is_disabled(), "restoring interface state");
                self.save_interface(iface).await?
            }
            None => {
                info!(interface = %id, "creating missing interface");
                match self.save_interface(iface).await {
                    Ok(saved) => saved,
                    Err(e) => {
                        if update_db_on_error {
                            self.mark_missing(&id).await;
                        }
                        return Err(e);
                    }
                }
            }
        };

        for peer in &peers {
            self.apply_physical_peer(controller.as_ref(), &saved, peer)
                .await
                .context("restore peer", peer.identifier.clone())?;
        }

        let managed: HashSet<PublicKey> = peers.iter().map(|p| p.interface.public_key).collect();
        for pp in controller.peers(&id).await? {
            if !managed.contains(&pp.public_key) {
                debug!(interface = %id, peer = %pp.public_key.short(), "removing unmanaged peer");
                controller.delete_peer(&id, &pp.public_key).await?;
            }
        }
        Ok(())
    }

    async fn mark_missing(&self, id: &str) {
        let outcome = self
            .db
            .save_interface(
                id,
                repo_update(|current: Option<Interface>| {
                    let mut iface =
                        current.ok_or_else(|| VpnError::NotFound(format!("interface {id}")))?;
                    iface.disable(reasons::MISSING_INTERFACE);
                    Ok(iface)
                }),
            )
            .await;
        if let Err(e) = outcome {
            warn!(interface = %id, error = %e, "failed to record missing interface");
        }
    }

    /// Full resynchronization of every interface's peer set.
    ///
    /// Returns the number of peers applied. Interfaces that fail are logged
    /// and skipped.
    ///
    /// # Errors
    ///
    /// Admin only.
    pub async fn sync_all_peers_from_db(&self, caller: &CallerIdentity) -> Result<usize> {
        caller.require_admin()?;
        let mut applied = 0;
        for iface in self.db.interfaces().await? {
            let id = iface.identifier.clone();
            match self.bounded("sync peers of", &id, self.sync_interface(iface)).await {
                Ok(n) => applied += n,
                Err(e) => error!(interface = %id, error = %e, "peer sync failed"),
            }
        }
        Ok(applied)
    }

    async fn sync_interface(&self, iface: Interface) -> Result<usize> {
        let id = iface.identifier.clone();
        self.restore_one(iface, true).await?;

        let (iface, peers) = self.db.interface_and_peers(&id).await?;
        let desired: Vec<Peer> = if iface.is_disabled() {
            Vec::new()
        } else {
            peers.into_iter().filter(|p| !p.is_disabled()).collect()
        };

        match self.replace_peers(&iface, &desired).await {
            Ok(()) => {}
            Err(e) if e.is_not_exist() => {
                warn!(interface = %id, error = %e, "interface vanished during sync, restoring and retrying");
                self.restore_one(iface.clone(), true).await?;
                self.replace_peers(&iface, &desired).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(desired.len())
    }

    /// Replaces the device's peer set, in one call when the backend can.
    async fn replace_peers(&self, iface: &Interface, desired: &[Peer]) -> Result<()> {
        let controller = self.controller(&iface.backend)?;
        let id = &iface.identifier;

        if let Some(replacer) = controller.peer_replacer() {
            if desired.is_empty() {
                replacer.clear_peers(id).await?;
            } else {
                let physical = desired
                    .iter()
                    .map(|peer| {
                        let mut pp = PhysicalPeer::new(peer.interface.public_key);
                        pp.import_source = controller.kind();
                        peer.merge_to_physical(&mut pp);
                        pp
                    })
                    .collect();
                replacer.replace_peers(id, physical).await?;
            }
            return Ok(());
        }

        for pp in controller.peers(id).await? {
            controller.delete_peer(id, &pp.public_key).await?;
        }
        for peer in desired {
            self.apply_physical_peer(controller.as_ref(), iface, peer)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Harness, harness, harness_with};
    use super::*;
    use crate::config::VpnConfig;
    use crate::repository::InterfaceAndPeerRepository;
    use claw_wireguard::{Controller, KeyPair};

    fn admin() -> CallerIdentity {
        CallerIdentity::admin("root")
    }

    async fn interface_with_peers(h: &Harness, count: usize) -> (Interface, Vec<Peer>) {
        let iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        let iface = h.manager.create_interface(&admin(), iface).await.expect("create");
        let mut peers = Vec::new();
        for _ in 0..count {
            let peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
            peers.push(h.manager.create_peer(&admin(), peer).await.expect("create peer"));
        }
        (iface, peers)
    }

    fn stray_peer() -> PhysicalPeer {
        PhysicalPeer::new(*KeyPair::generate().public_key())
    }

    #[tokio::test]
    async fn restore_on_disabled_interface_leaves_no_peers() {
        let h = harness();
        let (iface, _) = interface_with_peers(&h, 3).await;
        h.device.insert_peer(&iface.identifier, stray_peer()).expect("stray");

        h.repo
            .save_interface(
                &iface.identifier,
                repo_update(|current: Option<Interface>| {
                    let mut iface = current.expect("stored");
                    iface.disable(reasons::ADMIN_DISABLED);
                    Ok(iface)
                }),
            )
            .await
            .expect("disable in db");

        h.manager
            .restore_interface_state(&admin(), false, &[])
            .await
            .expect("restore");
        assert!(h.device.peers(&iface.identifier).await.expect("device").is_empty());
        assert!(!h.device.interface(&iface.identifier).await.expect("device").device_up);
    }

    #[tokio::test]
    async fn restore_leaves_matching_device_untouched() {
        let h = harness();
        let mut iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        iface.dns_str = "1.1.1.1".into();
        iface.pre_up = "echo up".into();
        let iface = h.manager.create_interface(&admin(), iface).await.expect("create");
        let before = h.repo.interface(&iface.identifier).await.expect("stored");
        let hook_calls = h.hooks.calls().len();
        let mut updates = h.manager.bus().interface_updated.subscribe();
        let mut routes = h.manager.bus().route_update.subscribe();

        h.manager
            .restore_interface_state(&admin(), true, &[])
            .await
            .expect("restore");

        let after = h.repo.interface(&iface.identifier).await.expect("stored");
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(h.hooks.calls().len(), hook_calls);
        assert!(updates.try_recv().is_err());
        assert!(routes.try_recv().is_err());
    }

    #[tokio::test]
    async fn restore_pushes_drifted_device() {
        let h = harness();
        let (iface, _) = interface_with_peers(&h, 0).await;
        let mut drifted = h.device.interface(&iface.identifier).await.expect("device");
        drifted.listen_port += 1;
        h.device.insert_interface(drifted);
        let mut updates = h.manager.bus().interface_updated.subscribe();

        h.manager
            .restore_interface_state(&admin(), true, &[])
            .await
            .expect("restore");

        let physical = h.device.interface(&iface.identifier).await.expect("device");
        assert_eq!(physical.listen_port, iface.listen_port);
        assert_eq!(updates.recv().await.expect("update").identifier, iface.identifier);
    }

    #[tokio::test]
    async fn restore_recreates_missing_interface() {
        let h = harness();
        let (iface, peers) = interface_with_peers(&h, 2).await;
        h.device.delete_interface(&iface.identifier).await.expect("drop device");

        h.manager
            .restore_interface_state(&admin(), true, &[])
            .await
            .expect("restore");
        let physical = h.device.peers(&iface.identifier).await.expect("device");
        assert_eq!(physical.len(), peers.len());
        assert!(h.device.interface(&iface.identifier).await.expect("device").device_up);
    }

    #[tokio::test]
    async fn restore_removes_unmanaged_and_disabled_peers() {
        let h = harness();
        let (iface, peers) = interface_with_peers(&h, 2).await;
        h.device.insert_peer(&iface.identifier, stray_peer()).expect("stray");
        let mut disabled = peers[0].clone();
        disabled.disable(reasons::USER_DISABLED);
        h.repo
            .save_peer(&disabled.identifier.clone(), repo_update(move |_| Ok(disabled)))
            .await
            .expect("disable peer in db");

        h.manager
            .restore_interface_state(&admin(), false, &[])
            .await
            .expect("restore");
        let physical = h.device.peers(&iface.identifier).await.expect("device");
        assert_eq!(physical.len(), 1);
        assert_eq!(physical[0].public_key, peers[1].interface.public_key);
    }

    #[tokio::test]
    async fn failed_creation_is_recorded_and_sweep_continues() {
        let h = harness();
        let (broken, _) = interface_with_peers(&h, 0).await;
        let (healthy, _) = interface_with_peers(&h, 1).await;
        h.device.delete_interface(&broken.identifier).await.expect("drop");
        h.device.delete_interface(&healthy.identifier).await.expect("drop");
        h.device.fail_saves_for(&broken.identifier);

        h.manager
            .restore_interface_state(&admin(), true, &[])
            .await
            .expect("sweep");

        let (stored, _) = h
            .manager
            .get_interface_and_peers(&admin(), &broken.identifier)
            .await
            .expect("stored");
        assert!(stored.is_disabled());
        assert_eq!(stored.disabled_reason, reasons::MISSING_INTERFACE);
        assert_eq!(h.device.peers(&healthy.identifier).await.expect("device").len(), 1);
    }

    #[tokio::test]
    async fn restore_honours_filter() {
        let h = harness();
        let (first, _) = interface_with_peers(&h, 0).await;
        let (second, _) = interface_with_peers(&h, 0).await;
        h.device.delete_interface(&first.identifier).await.expect("drop");
        h.device.delete_interface(&second.identifier).await.expect("drop");

        h.manager
            .restore_interface_state(&admin(), false, &[second.identifier.clone()])
            .await
            .expect("restore");
        assert_eq!(h.device.interface_names(), vec![second.identifier]);
    }

    #[tokio::test]
    async fn sync_replaces_peer_sets() {
        for bulk in [true, false] {
            let h = harness_with(VpnConfig::default(), bulk);
            let (iface, peers) = interface_with_peers(&h, 3).await;
            let (_, none) = interface_with_peers(&h, 0).await;
            assert!(none.is_empty());
            h.device.insert_peer(&iface.identifier, stray_peer()).expect("stray");

            let mut disabled = peers[2].clone();
            disabled.disable(reasons::USER_DISABLED);
            h.repo
                .save_peer(&disabled.identifier.clone(), repo_update(move |_| Ok(disabled)))
                .await
                .expect("disable");

            let applied = h.manager.sync_all_peers_from_db(&admin()).await.expect("sync");
            assert_eq!(applied, 2, "bulk replace: {bulk}");
            let physical = h.device.peers(&iface.identifier).await.expect("device");
            assert_eq!(physical.len(), 2, "bulk replace: {bulk}");
        }
    }

    #[tokio::test]
    async fn sync_requires_admin() {
        let h = harness();
        let err = h
            .manager
            .sync_all_peers_from_db(&CallerIdentity::user("alice"))
            .await
            .expect_err("denied");
        assert!(matches!(err, VpnError::NoPermission(_)));
    }
}
