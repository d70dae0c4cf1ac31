use std::collections::HashSet;
use std::iter;

use chrono::{DateTime, Utc};
use claw_wireguard::{Controller, DEFAULT_MTU, KeyPair, PhysicalInterface, update_fn};
use ipnet::IpNet;
use tracing::{debug, info, warn};

use super::Manager;
use crate::allocator;
use crate::domain::{
    CREATED_BY_IMPORTER, CallerIdentity, ConfigOption, Interface, InterfaceType, Peer,
    PeerDefaults, RoutingTableInfo, cidr, reasons,
};
use crate::error::{Result, ResultExt, VpnError};
use crate::repository::repo_update;

const DEFAULT_PEER_KEEPALIVE: u16 = 16;

/// A device interface unknown to the repository.
#[derive(Debug, Clone)]
pub struct ImportableInterface {
    /// Backend reporting the interface.
    pub backend: String,
    /// Device state.
    pub interface: PhysicalInterface,
}

impl Manager {
    /// Device interfaces that could be imported.
    ///
    /// # Errors
    ///
    /// Admin only. Fails when a backend cannot be enumerated.
    pub async fn get_importable_interfaces(
        &self,
        caller: &CallerIdentity,
    ) -> Result<Vec<ImportableInterface>> {
        caller.require_admin()?;
        self.bounded("list importable interfaces", "", async {
            let known = self.known_interfaces().await?;
            let mut out = Vec::new();
            for controller in self.registry.controllers() {
                for interface in controller.interfaces().await? {
                    if !known.contains(&interface.identifier) {
                        out.push(ImportableInterface {
                            backend: controller.id().to_string(),
                            interface,
                        });
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    async fn known_interfaces(&self) -> Result<HashSet<String>> {
        Ok(self
            .db
            .interfaces()
            .await?
            .into_iter()
            .map(|i| i.identifier)
            .collect())
    }

    /// Imports device interfaces, and their peers, that the repository does
    /// not know yet. A non-empty `filter` limits the import to those names.
    ///
    /// Returns the number of imported interfaces. Failing interfaces are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Admin only.
    pub async fn import_new_interfaces(
        &self,
        caller: &CallerIdentity,
        filter: &[String],
    ) -> Result<usize> {
        caller.require_admin()?;
        let mut known = self.known_interfaces().await?;

        let mut imported = 0;
        for controller in self.registry.controllers() {
            let physical = match controller.interfaces().await {
                Ok(list) => list,
                Err(e) => {
                    warn!(backend = %controller.id(), error = %e, "failed to enumerate interfaces");
                    continue;
                }
            };
            for pi in physical {
                if known.contains(&pi.identifier)
                    || (!filter.is_empty() && !filter.contains(&pi.identifier))
                {
                    continue;
                }
                info!(interface = %pi.identifier, backend = %controller.id(), "importing new interface");
                let outcome = self
                    .bounded(
                        "import interface",
                        &pi.identifier,
                        self.import_interface(controller.as_ref(), &pi),
                    )
                    .await;
                match outcome {
                    Ok(peers) => {
                        info!(interface = %pi.identifier, peers, "imported interface");
                        known.insert(pi.identifier);
                        imported += 1;
                    }
                    Err(e) => warn!(interface = %pi.identifier, error = %e, "import failed"),
                }
            }
        }
        Ok(imported)
    }

    async fn import_interface(
        &self,
        controller: &dyn Controller,
        pi: &PhysicalInterface,
    ) -> Result<usize> {
        let physical_peers = controller.peers(&pi.identifier).await?;

        let now = Utc::now();
        let mut iface = Interface::from_physical(pi, controller.id());
        iface.created_by = CREATED_BY_IMPORTER.to_string();
        iface.updated_by = CREATED_BY_IMPORTER.to_string();
        iface.created_at = now;
        iface.updated_at = now;
        iface.peer_defaults.allowed_ips_str = cidr::join_cidrs(&iface.addresses);

        let id = iface.identifier.clone();
        let dup = id.clone();
        let iface = self
            .db
            .save_interface(
                &id,
                repo_update(move |existing: Option<Interface>| match existing {
                    Some(_) => Err(VpnError::DuplicateEntry(format!("interface {dup}"))),
                    None => Ok(iface),
                }),
            )
            .await?;

        for pp in &physical_peers {
            let peer = import_peer(&iface, pp);
            debug!(interface = %iface.identifier, peer = %peer.identifier, "importing peer");
            self.db
                .save_peer(&peer.identifier.clone(), repo_update(move |_| Ok(peer)))
                .await?;
        }
        Ok(physical_peers.len())
    }

    /// A fresh, unsaved interface with conflict-free name, port and
    /// addresses.
    ///
    /// # Errors
    ///
    /// Admin only. Fails when the port or address space is exhausted.
    pub async fn prepare_interface(&self, caller: &CallerIdentity) -> Result<Interface> {
        caller.require_admin()?;
        let adv = &self.cfg.advanced;

        let existing = self.db.interfaces().await?;
        let mut names: Vec<String> = existing.iter().map(|i| i.identifier.clone()).collect();
        for controller in self.registry.controllers() {
            match controller.interfaces().await {
                Ok(list) => names.extend(list.into_iter().map(|i| i.identifier)),
                Err(e) => debug!(backend = %controller.id(), error = %e, "skipping backend for name probe"),
            }
        }
        let id = allocator::next_interface_name(names.iter().map(String::as_str));

        let used_ports: Vec<u16> = existing.iter().map(|i| i.listen_port).collect();
        let port = allocator::fresh_listen_port(adv.start_listen_port, &used_ports)?;

        let used_ips = self.db.interface_ips().await?;
        let start_v6 = if adv.use_ip_v6 { Some(adv.start_v6()?) } else { None };
        let (v4, v6) = allocator::fresh_interface_addresses(adv.start_v4()?, start_v6, &used_ips)?;
        let addresses: Vec<IpNet> = iter::once(v4).chain(v6).collect();
        let networks: Vec<IpNet> = addresses.iter().map(IpNet::trunc).collect();

        let now = Utc::now();
        let mut iface = Interface {
            identifier: id.clone(),
            display_name: id,
            listen_port: port,
            addresses,
            mtu: DEFAULT_MTU,
            interface_type: InterfaceType::Server,
            backend: self.cfg.default_backend().to_string(),
            peer_defaults: PeerDefaults {
                allowed_ips_str: cidr::join_cidrs(&networks),
                network: networks,
                mtu: DEFAULT_MTU,
                persistent_keepalive: DEFAULT_PEER_KEEPALIVE,
                ..PeerDefaults::default()
            },
            created_by: caller.user_id.clone(),
            updated_by: caller.user_id.clone(),
            created_at: now,
            updated_at: now,
            ..Interface::default()
        };
        iface.set_key_pair(&KeyPair::generate());
        Ok(iface)
    }

    /// Validates, persists and brings up a new interface.
    ///
    /// # Errors
    ///
    /// Admin only; [`VpnError::DuplicateEntry`] if the identifier is taken;
    /// [`VpnError::InvalidData`] for bad input or an unknown backend.
    pub async fn create_interface(
        &self,
        caller: &CallerIdentity,
        mut iface: Interface,
    ) -> Result<Interface> {
        caller.require_admin()?;
        let id = iface.identifier.clone();
        self.bounded("create interface", &id, async {
            match self.db.interface(&iface.identifier).await {
                Ok(_) => {
                    return Err(VpnError::DuplicateEntry(format!(
                        "interface {} already exists",
                        iface.identifier
                    )));
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            iface.validate()?;
            if !iface.backend.is_empty() && !self.registry.contains(&iface.backend) {
                return Err(VpnError::InvalidData(format!(
                    "backend {} does not exist",
                    iface.backend
                )));
            }
            iface.created_by.clone_from(&caller.user_id);
            iface.updated_by.clone_from(&caller.user_id);

            let saved = self.save_interface(iface).await?;
            self.bus.interface_created.publish(saved.clone());
            Ok(saved)
        })
        .await
    }

    /// Applies changes to an existing interface.
    ///
    /// Returns the saved interface and its peers. When the interface was
    /// enabled or disabled, its peers are pushed or removed accordingly.
    ///
    /// # Errors
    ///
    /// Admin only; [`VpnError::NotFound`] if it does not exist.
    pub async fn update_interface(
        &self,
        caller: &CallerIdentity,
        mut iface: Interface,
    ) -> Result<(Interface, Vec<Peer>)> {
        caller.require_admin()?;
        let id = iface.identifier.clone();
        self.bounded("update interface", &id, async {
            let (existing, peers) = self.db.interface_and_peers(&iface.identifier).await?;
            iface.validate()?;
            iface.updated_by.clone_from(&caller.user_id);

            let toggled = existing.is_disabled() != iface.is_disabled();
            let saved = self.save_interface(iface).await?;
            if toggled {
                self.push_interface_peers(&saved, &peers).await?;
            }
            Ok((saved, peers))
        })
        .await
    }

    /// Tears an interface down and removes it with all its peers.
    ///
    /// # Errors
    ///
    /// Admin only; [`VpnError::NotFound`] if it does not exist; hook or
    /// device failures abort the deletion.
    pub async fn delete_interface(&self, caller: &CallerIdentity, id: &str) -> Result<()> {
        caller.require_admin()?;
        self.bounded("delete interface", id, async {
            let (mut existing, controller) = self.controller_for(id).await?;
            existing.disable(reasons::DELETED);

            let physical = controller.interface(id).await.ok();

            self.run_pre_hooks(&existing).await?;
            self.run_pre_actions(&existing).await?;

            for peer in self.db.interface_peers(id).await? {
                match controller.delete_peer(id, &peer.interface.public_key).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_exist() => {}
                    Err(e) => return Err(VpnError::from(e).context("delete peer", peer.identifier)),
                }
                self.db.delete_peer(&peer.identifier).await?;
                self.bus.peer_deleted.publish(peer);
            }

            match controller.delete_interface(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_exist() => debug!(interface = %id, "device interface already gone"),
                Err(e) => return Err(e.into()),
            }
            self.db.delete_interface(id).await?;

            self.bus
                .route_remove
                .publish(removal_info(&existing, physical.as_ref()));
            self.run_post_hooks(&existing).await?;

            info!(interface = %id, "interface deleted");
            self.bus.interface_deleted.publish(existing);
            Ok(())
        })
        .await
    }

    /// Re-applies the interface's peer defaults to all its peers, leaving
    /// options marked non-overridable untouched.
    ///
    /// # Errors
    ///
    /// Admin only. Stops at the first peer that fails to save.
    pub async fn apply_peer_defaults(&self, caller: &CallerIdentity, iface: &Interface) -> Result<()> {
        caller.require_admin()?;
        self.bounded("apply peer defaults", &iface.identifier, async {
            self.db.interface(&iface.identifier).await?;
            for mut peer in self.db.interface_peers(&iface.identifier).await? {
                peer.apply_interface_defaults(iface);
                peer.updated_by.clone_from(&caller.user_id);
                let id = peer.identifier.clone();
                self.save_peer(iface, peer)
                    .await
                    .context("apply defaults to peer", id)?;
            }
            Ok(())
        })
        .await
    }

    /// Pushes `iface` onto its device and persists it.
    ///
    /// Hooks run only when the enabled state or device-relevant fields
    /// changed. Nothing is written to the repository if the device rejects
    /// the change.
    pub(super) async fn save_interface(&self, iface: Interface) -> Result<Interface> {
        let controller = self.controller(&iface.backend)?;
        let stored = match self.db.interface(&iface.identifier).await {
            Ok(stored) => Some(stored),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let physical = match controller.interface(&iface.identifier).await {
            Ok(pi) => Some(pi),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e.into()),
        };
        let state_changed = stored
            .as_ref()
            .is_some_and(|s| s.is_disabled() != iface.is_disabled())
            || physical.as_ref().is_none_or(|pi| iface.differs_from_physical(pi));

        if state_changed {
            self.run_pre_hooks(&iface).await?;
        }
        self.run_pre_actions(&iface).await?;

        let desired = iface.clone();
        controller
            .save_interface(
                &iface.identifier,
                update_fn(move |pi: &mut PhysicalInterface| {
                    desired.merge_to_physical(pi);
                    Ok(())
                }),
            )
            .await?;

        let now = Utc::now();
        let saved = self
            .db
            .save_interface(
                &iface.identifier.clone(),
                repo_update(move |current: Option<Interface>| {
                    let mut next = iface;
                    match current {
                        Some(old) => {
                            next.created_at = old.created_at;
                            next.created_by = old.created_by;
                        }
                        None if next.created_at == DateTime::<Utc>::default() => {
                            next.created_at = now;
                        }
                        None => {}
                    }
                    next.updated_at = now;
                    Ok(next)
                }),
            )
            .await?;

        self.bus.route_update.publish(saved.routing_info());
        if saved.is_disabled() {
            let physical = controller.interface(&saved.identifier).await.ok();
            self.bus
                .route_remove
                .publish(removal_info(&saved, physical.as_ref()));
        }

        if state_changed {
            self.run_post_hooks(&saved).await?;
        }
        debug!(interface = %saved.identifier, state_changed, "interface saved");
        self.bus.interface_updated.publish(saved.clone());
        Ok(saved)
    }

    async fn push_interface_peers(&self, iface: &Interface, peers: &[Peer]) -> Result<()> {
        let controller = self.controller(&iface.backend)?;
        for peer in peers {
            self.apply_physical_peer(controller.as_ref(), iface, peer)
                .await
                .context("push peer", peer.identifier.clone())?;
        }
        Ok(())
    }

    async fn run_pre_hooks(&self, iface: &Interface) -> Result<()> {
        let hook = if iface.is_disabled() { &iface.pre_down } else { &iface.pre_up };
        self.hooks.execute_interface_hook(&iface.identifier, hook).await
    }

    async fn run_post_hooks(&self, iface: &Interface) -> Result<()> {
        let hook = if iface.is_disabled() { &iface.post_down } else { &iface.post_up };
        self.hooks.execute_interface_hook(&iface.identifier, hook).await
    }

    async fn run_pre_actions(&self, iface: &Interface) -> Result<()> {
        if iface.is_disabled() {
            self.hooks.unset_dns(&iface.identifier).await
        } else if iface.dns_str.trim().is_empty() {
            Ok(())
        } else {
            self.hooks
                .set_dns(&iface.identifier, &iface.dns_str, &iface.dns_search_str)
                .await
        }
    }
}

/// Mark and table whose policy rules must go, preferring the device's mark
/// when the stored one was generated.
fn removal_info(iface: &Interface, physical: Option<&PhysicalInterface>) -> RoutingTableInfo {
    let mut info = iface.routing_info();
    if info.fw_mark == 0 {
        info.fw_mark = physical.map_or(0, |pi| pi.firewall_mark);
    }
    info
}

fn import_peer(iface: &Interface, pp: &claw_wireguard::PhysicalPeer) -> Peer {
    let now = Utc::now();
    let mut peer = Peer::from_physical(pp, &iface.identifier);
    peer.created_by = CREATED_BY_IMPORTER.to_string();
    peer.updated_by = CREATED_BY_IMPORTER.to_string();
    peer.created_at = now;
    peer.updated_at = now;

    let pd = &iface.peer_defaults;
    peer.endpoint_public_key = ConfigOption::new(
        iface.public_key.map(|k| k.to_base64()).unwrap_or_default(),
        true,
    );
    peer.allowed_ips_str = ConfigOption::new(pd.allowed_ips_str.clone(), true);
    if peer.interface.dns_str.get().is_empty() {
        peer.interface.dns_str = ConfigOption::new(pd.dns_str.clone(), true);
    }
    peer.interface.dns_search_str = ConfigOption::new(pd.dns_search_str.clone(), true);
    peer.interface.mtu = ConfigOption::new(pd.mtu, true);
    peer.interface.firewall_mark = ConfigOption::new(pd.firewall_mark, true);
    peer.interface.routing_table = ConfigOption::new(pd.routing_table.clone(), true);
    peer.interface.pre_up = ConfigOption::new(pd.pre_up.clone(), true);
    peer.interface.post_up = ConfigOption::new(pd.post_up.clone(), true);
    peer.interface.pre_down = ConfigOption::new(pd.pre_down.clone(), true);
    peer.interface.post_down = ConfigOption::new(pd.post_down.clone(), true);

    let short = pp.public_key.short();
    let (peer_type, name) = match iface.interface_type {
        InterfaceType::Any => (InterfaceType::Any, format!("Autodetected Peer ({short})")),
        InterfaceType::Client => (InterfaceType::Server, format!("Autodetected Endpoint ({short})")),
        InterfaceType::Server => (InterfaceType::Client, format!("Autodetected Client ({short})")),
    };
    peer.interface.peer_type = peer_type;
    peer.display_name = name;
    peer
}

#[cfg(test)]
mod tests {
    use super::super::testing::{harness, harness_with};
    use super::*;
    use crate::config::VpnConfig;
    use crate::hooks::HookCall;
    use claw_wireguard::{Controller, PhysicalPeer};

    fn net(s: &str) -> IpNet {
        s.parse().expect("cidr")
    }

    fn admin() -> CallerIdentity {
        CallerIdentity::admin("root")
    }

    #[tokio::test]
    async fn prepare_allocates_fresh_values() {
        let h = harness();
        let first = h.manager.prepare_interface(&admin()).await.expect("prepare");
        assert_eq!(first.identifier, "wg0");
        assert_eq!(first.listen_port, 51820);
        assert_eq!(first.addresses[0], net("10.11.12.1/24"));
        assert_eq!(first.addresses.len(), 2);
        assert_eq!(first.peer_defaults.allowed_ips_str, "10.11.12.0/24,fdfd:d3ad:c0de:1234::/64");
        assert_eq!(first.peer_defaults.persistent_keepalive, 16);
        assert!(first.public_key.is_some());
        h.manager.create_interface(&admin(), first).await.expect("create");

        let second = h.manager.prepare_interface(&admin()).await.expect("prepare");
        assert_eq!(second.identifier, "wg1");
        assert_eq!(second.listen_port, 51821);
        assert_eq!(second.addresses[0], net("10.11.13.1/24"));
    }

    #[tokio::test]
    async fn prepare_without_ipv6() {
        let mut cfg = VpnConfig::default();
        cfg.advanced.use_ip_v6 = false;
        let h = harness_with(cfg, false);
        let iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        assert_eq!(iface.addresses, vec![net("10.11.12.1/24")]);
    }

    #[tokio::test]
    async fn create_runs_up_hooks_and_reaches_device() {
        let h = harness();
        let mut iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        iface.pre_up = "echo pre".into();
        iface.post_up = "echo post".into();
        iface.dns_str = "1.1.1.1".into();
        let mut updates = h.manager.bus().route_update.subscribe();

        let saved = h.manager.create_interface(&admin(), iface).await.expect("create");
        assert_eq!(h.device.interface_names(), vec!["wg0".to_string()]);
        assert_eq!(saved.created_by, "root");
        assert_eq!(
            h.hooks.calls(),
            vec![
                HookCall::Hook { interface: "wg0".into(), command: "echo pre".into() },
                HookCall::SetDns { interface: "wg0".into(), dns: "1.1.1.1".into() },
                HookCall::Hook { interface: "wg0".into(), command: "echo post".into() },
            ]
        );
        assert_eq!(updates.recv().await.expect("route update").interface, "wg0");
    }

    #[tokio::test]
    async fn create_rejects_duplicates_and_non_admins() {
        let h = harness();
        let iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        let err = h
            .manager
            .create_interface(&CallerIdentity::user("alice"), iface.clone())
            .await
            .expect_err("not admin");
        assert!(matches!(err.root(), VpnError::NoPermission(_)));

        h.manager.create_interface(&admin(), iface.clone()).await.expect("create");
        let err = h.manager.create_interface(&admin(), iface).await.expect_err("duplicate");
        assert!(matches!(err.root(), VpnError::DuplicateEntry(_)));
    }

    #[tokio::test]
    async fn create_rejects_unknown_backend() {
        let h = harness();
        let mut iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        iface.backend = "nowhere".into();
        let err = h.manager.create_interface(&admin(), iface).await.expect_err("backend");
        assert!(matches!(err.root(), VpnError::InvalidData(_)));
        assert!(h.device.interface_names().is_empty());
    }

    #[tokio::test]
    async fn device_failure_leaves_repository_untouched() {
        let h = harness();
        let iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        h.device.fail_saves_for(&iface.identifier);
        let err = h.manager.create_interface(&admin(), iface).await.expect_err("device");
        assert!(err.to_string().starts_with("create interface wg0:"));
        assert!(h.manager.get_all_interfaces_and_peers(&admin()).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn metadata_edit_skips_hooks() {
        let h = harness();
        let mut iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        iface.pre_up = "echo pre".into();
        let iface = h.manager.create_interface(&admin(), iface).await.expect("create");
        h.hooks.clear();

        let mut renamed = iface.clone();
        renamed.display_name = "Office".into();
        let (saved, _) = h.manager.update_interface(&admin(), renamed).await.expect("update");
        assert_eq!(saved.display_name, "Office");
        assert_eq!(saved.created_at, iface.created_at);
        assert!(h.hooks.calls().is_empty());
    }

    #[tokio::test]
    async fn disabling_runs_down_hooks_and_removes_peers() {
        let h = harness();
        let mut iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        iface.pre_down = "echo down".into();
        let iface = h.manager.create_interface(&admin(), iface).await.expect("create");
        let peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
        h.manager.create_peer(&admin(), peer).await.expect("create peer");
        assert_eq!(h.device.peers("wg0").await.expect("peers").len(), 1);
        h.hooks.clear();

        let mut removals = h.manager.bus().route_remove.subscribe();
        let mut disabled = iface.clone();
        disabled.disable(reasons::ADMIN_DISABLED);
        h.manager.update_interface(&admin(), disabled).await.expect("update");

        assert!(h.hooks.calls().contains(&HookCall::Hook {
            interface: "wg0".into(),
            command: "echo down".into()
        }));
        assert!(h.hooks.calls().contains(&HookCall::UnsetDns { interface: "wg0".into() }));
        assert!(h.device.peers("wg0").await.expect("peers").is_empty());
        assert_eq!(removals.recv().await.expect("removal").interface, "wg0");
    }

    #[tokio::test]
    async fn failing_hook_aborts_save() {
        let h = harness();
        let mut iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        iface.pre_up = "echo up".into();
        h.hooks.fail_for(&iface.identifier);
        let err = h.manager.create_interface(&admin(), iface).await.expect_err("hook");
        assert!(matches!(err.root(), VpnError::Hook { .. }));
        assert!(h.device.interface_names().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let h = harness();
        let iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        let iface = h.manager.create_interface(&admin(), iface).await.expect("create");
        for _ in 0..2 {
            let peer = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
            h.manager.create_peer(&admin(), peer).await.expect("create peer");
        }
        let mut removals = h.manager.bus().route_remove.subscribe();

        h.manager.delete_interface(&admin(), "wg0").await.expect("delete");
        assert!(h.device.interface_names().is_empty());
        let all = h.manager.get_all_interfaces_and_peers(&admin()).await.expect("list");
        assert!(all.is_empty());
        assert!(h.manager.get_user_peers(&admin(), "root").await.expect("peers").is_empty());
        assert_eq!(removals.recv().await.expect("removal").interface, "wg0");

        let err = h.manager.delete_interface(&admin(), "wg0").await.expect_err("gone");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn import_splits_and_names_peers() {
        let h = harness();
        let mut pi = PhysicalInterface::new("wg9");
        pi.set_key_pair(&KeyPair::generate());
        pi.addresses = vec![net("10.9.0.1/24")];
        h.device.insert_interface(pi);

        let key = *KeyPair::generate().public_key();
        let mut pp = PhysicalPeer::new(key);
        pp.allowed_ips = vec![net("10.9.0.2/32"), net("192.168.50.0/24")];
        h.device.insert_peer("wg9", pp).expect("peer");

        let importable = h.manager.get_importable_interfaces(&admin()).await.expect("list");
        assert_eq!(importable.len(), 1);
        assert_eq!(importable[0].backend, "local");

        let n = h.manager.import_new_interfaces(&admin(), &[]).await.expect("import");
        assert_eq!(n, 1);

        let (iface, peers) = h.manager.get_interface_and_peers(&admin(), "wg9").await.expect("load");
        assert_eq!(iface.created_by, CREATED_BY_IMPORTER);
        assert_eq!(iface.peer_defaults.allowed_ips_str, "10.9.0.1/24");
        assert_eq!(peers.len(), 1);
        let peer = &peers[0];
        assert_eq!(peer.interface.addresses, vec![net("10.9.0.2/32")]);
        assert_eq!(peer.extra_allowed_ips_str, "192.168.50.0/24");
        assert_eq!(peer.display_name, format!("Autodetected Peer ({})", key.short()));
        assert_eq!(peer.interface.peer_type, InterfaceType::Any);

        assert_eq!(h.manager.import_new_interfaces(&admin(), &[]).await.expect("again"), 0);
        assert!(h.manager.get_importable_interfaces(&admin()).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn import_respects_filter() {
        let h = harness();
        h.device.insert_interface(PhysicalInterface::new("wg1"));
        h.device.insert_interface(PhysicalInterface::new("wg2"));
        let n = h
            .manager
            .import_new_interfaces(&admin(), &["wg2".to_string()])
            .await
            .expect("import");
        assert_eq!(n, 1);
        assert!(h.manager.get_interface_and_peers(&admin(), "wg1").await.is_err());
        assert!(h.manager.get_interface_and_peers(&admin(), "wg2").await.is_ok());
    }

    #[tokio::test]
    async fn peer_defaults_respect_overridable() {
        let h = harness();
        let iface = h.manager.prepare_interface(&admin()).await.expect("prepare");
        let mut iface = h.manager.create_interface(&admin(), iface).await.expect("create");
        let mut pinned = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
        pinned.persistent_keepalive = ConfigOption::new(60, false);
        let pinned = h.manager.create_peer(&admin(), pinned).await.expect("create");
        let free = h.manager.prepare_peer(&admin(), &iface.identifier).await.expect("peer");
        let free = h.manager.create_peer(&admin(), free).await.expect("create");

        iface.peer_defaults.persistent_keepalive = 33;
        h.manager.apply_peer_defaults(&admin(), &iface).await.expect("apply");

        let pinned = h.manager.get_peer(&admin(), &pinned.identifier).await.expect("pinned");
        let free = h.manager.get_peer(&admin(), &free.identifier).await.expect("free");
        assert_eq!(*pinned.persistent_keepalive.get(), 60);
        assert_eq!(*free.persistent_keepalive.get(), 33);
    }
}
