//! Policy routing for managed interfaces.
//!
//! Every enabled interface with route management gets its own routing table
//! holding the allowed IPs of its peers, plus a `not fwmark <mark> lookup
//! <table>` rule. When any interface routes a default network, a single
//! `lookup main suppress_prefixlength 0` rule per family keeps the host's own
//! default route usable for the tunnel traffic itself.
//!
//! Passes are triggered by `route_update` events and serialized; rules and
//! routes are only added when missing, so repeated passes converge.

use std::collections::HashSet;
use std::sync::Arc;

use claw_wireguard::netlink::{Family, LinkInfo, MAIN_TABLE, NetlinkOps, RouteSpec, RuleSpec};
use claw_wireguard::{BackendKind, Controller, ControllerRegistry, PhysicalInterface, update_fn};
use ipnet::IpNet;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::VpnConfig;
use crate::domain::{Interface, Peer, RoutingTableInfo};
use crate::error::{Result, VpnError};
use crate::events::EventBus;
use crate::repository::{InterfaceAndPeerRepository, Repositories};

/// Fwmark rules are placed at the first free priority at or below this one.
pub const FWMARK_RULE_BASE_PRIORITY: u32 = 32700;

/// Keeps kernel routes and rules in line with the repository.
pub struct RouteSynchronizer {
    cfg: Arc<VpnConfig>,
    registry: Arc<ControllerRegistry>,
    db: Arc<dyn InterfaceAndPeerRepository>,
    netlink: Arc<dyn NetlinkOps>,
    bus: EventBus,
    pass: Mutex<()>,
}

impl std::fmt::Debug for RouteSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSynchronizer").finish_non_exhaustive()
    }
}

impl RouteSynchronizer {
    /// Creates a synchronizer working on `netlink`.
    pub fn new(
        cfg: Arc<VpnConfig>,
        registry: Arc<ControllerRegistry>,
        repos: &Repositories,
        netlink: Arc<dyn NetlinkOps>,
        bus: EventBus,
    ) -> Self {
        Self {
            cfg,
            registry,
            db: Arc::clone(&repos.interfaces),
            netlink,
            bus,
            pass: Mutex::new(()),
        }
    }

    /// Subscribes to route events until `token` is cancelled.
    pub fn start(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let on_update = Arc::clone(self);
        let update = self.bus.route_update.spawn_handler(token.clone(), move |info| {
            let this = Arc::clone(&on_update);
            async move {
                debug!(routing = %info, "route update requested");
                if let Err(e) = this.sync_all().await {
                    error!(error = %e, "route synchronization failed");
                }
            }
        });

        let on_remove = Arc::clone(self);
        let remove = self.bus.route_remove.spawn_handler(token.clone(), move |info| {
            let this = Arc::clone(&on_remove);
            async move {
                if let Err(e) = this.remove_routes(&info).await {
                    error!(routing = %info, error = %e, "route removal failed");
                }
            }
        });

        info!("route synchronizer started");
        vec![update, remove]
    }

    /// Brings routes and rules of every managed interface up to date.
    ///
    /// A failing interface is logged and skipped.
    ///
    /// # Errors
    ///
    /// Fails when the interface list cannot be loaded or the main table
    /// rules cannot be maintained.
    pub async fn sync_all(&self) -> Result<()> {
        let _pass = self.pass.lock().await;
        self.sync_locked().await
    }

    /// Removes the rules and routes recorded in `info`.
    ///
    /// Runs a regular pass afterwards so the main table rules follow.
    ///
    /// # Errors
    ///
    /// Fails when the kernel state cannot be listed.
    pub async fn remove_routes(&self, info: &RoutingTableInfo) -> Result<()> {
        let _pass = self.pass.lock().await;
        if info.fw_mark == 0 {
            debug!(routing = %info, "no firewall mark recorded, nothing to remove");
        } else {
            let table = info.table_id();
            for family in Family::ALL {
                for rule in self.netlink.rule_list(family).await? {
                    if rule.is_fwmark_rule(info.fw_mark, table) {
                        self.netlink.rule_del(&rule).await?;
                    }
                }
                if table == MAIN_TABLE {
                    continue;
                }
                for route in self.netlink.route_list(family, None).await? {
                    if route.table == table {
                        if let Err(e) = self.netlink.route_del(&route).await {
                            debug!(destination = %route.destination, error = %e, "route already gone");
                        }
                    }
                }
            }
            info!(routing = %info, "removed interface routes");
        }
        self.sync_locked().await
    }

    async fn sync_locked(&self) -> Result<()> {
        let mut default_families = HashSet::new();
        for iface in self.db.interfaces().await? {
            if iface.is_disabled() || !iface.manage_routing_table() {
                continue;
            }
            let controller = match self.registry.resolve(&iface.backend) {
                Ok(c) => c,
                Err(e) => {
                    warn!(interface = %iface.identifier, error = %e, "no controller for interface");
                    continue;
                }
            };
            if controller.kind() == BackendKind::Mikrotik {
                continue;
            }
            let peers: Vec<Peer> = self
                .db
                .interface_peers(&iface.identifier)
                .await?
                .into_iter()
                .filter(|p| !p.is_disabled())
                .collect();
            match self.sync_interface(&iface, controller.as_ref(), &peers).await {
                Ok(families) => default_families.extend(families),
                Err(e) => {
                    warn!(interface = %iface.identifier, error = %e, "failed to synchronize routes");
                }
            }
        }

        for family in Family::ALL {
            self.sync_main_rule(family, default_families.contains(&family))
                .await?;
        }
        Ok(())
    }

    /// Returns the families in which the interface routes a default network.
    async fn sync_interface(
        &self,
        iface: &Interface,
        controller: &dyn Controller,
        peers: &[Peer],
    ) -> Result<HashSet<Family>> {
        let link = self.netlink.link_by_name(&iface.identifier).await?;
        let info = self.resolve_mark(iface, controller, &link).await?;
        let table = info.table_id();

        let mut wanted: Vec<IpNet> = Vec::new();
        for net in iface.allowed_ips(peers) {
            if !wanted.contains(&net) {
                wanted.push(net);
            }
        }

        let mut defaults = HashSet::new();
        for family in Family::ALL {
            let routes: Vec<RouteSpec> = wanted
                .iter()
                .filter(|net| Family::of(net) == family)
                .map(|net| RouteSpec {
                    destination: *net,
                    if_index: link.index,
                    table,
                })
                .collect();

            for route in &routes {
                self.netlink.route_replace(route).await?;
            }
            for stale in self.netlink.route_list(family, Some(link.index)).await? {
                if stale.table == table && !routes.contains(&stale) {
                    debug!(interface = %iface.identifier, destination = %stale.destination, "removing stale route");
                    self.netlink.route_del(&stale).await?;
                }
            }

            if table == MAIN_TABLE {
                continue;
            }
            if routes.is_empty() {
                self.drop_fwmark_rules(family, info.fw_mark, table).await?;
                continue;
            }
            self.ensure_fwmark_rule(family, info.fw_mark, table).await?;
            if routes.iter().any(|r| r.destination.prefix_len() == 0) {
                defaults.insert(family);
            }
        }
        Ok(defaults)
    }

    /// Uses the stored mark, then the device's, then allocates one from the
    /// link index and writes it to the device.
    async fn resolve_mark(
        &self,
        iface: &Interface,
        controller: &dyn Controller,
        link: &LinkInfo,
    ) -> Result<RoutingTableInfo> {
        let mut info = iface.routing_info();
        if info.fw_mark != 0 {
            return Ok(info);
        }
        let physical = controller.interface(&iface.identifier).await?;
        if physical.firewall_mark != 0 {
            info.fw_mark = physical.firewall_mark;
            return Ok(info);
        }

        let mark = self
            .cfg
            .advanced
            .route_table_offset
            .checked_add(link.index)
            .ok_or_else(|| VpnError::InvalidData(format!("no firewall mark for {}", iface.identifier)))?;
        controller
            .save_interface(
                &iface.identifier,
                update_fn(move |pi: &mut PhysicalInterface| {
                    pi.firewall_mark = mark;
                    Ok(())
                }),
            )
            .await?;
        info!(interface = %iface.identifier, fwmark = mark, "allocated firewall mark");
        info.fw_mark = mark;
        Ok(info)
    }

    async fn ensure_fwmark_rule(&self, family: Family, mark: u32, table: u32) -> Result<()> {
        let rules = self.netlink.rule_list(family).await?;
        if rules.iter().any(|r| r.is_fwmark_rule(mark, table)) {
            return Ok(());
        }
        let priority = free_priority_below(&rules, FWMARK_RULE_BASE_PRIORITY)
            .ok_or_else(|| VpnError::InvalidData(format!("no free {family} rule priority")))?;
        self.netlink
            .rule_add(&RuleSpec::fwmark(family, mark, table, priority))
            .await?;
        debug!(%family, fwmark = mark, table, priority, "added fwmark rule");
        Ok(())
    }

    async fn drop_fwmark_rules(&self, family: Family, mark: u32, table: u32) -> Result<()> {
        for rule in self.netlink.rule_list(family).await? {
            if rule.is_fwmark_rule(mark, table) {
                self.netlink.rule_del(&rule).await?;
            }
        }
        Ok(())
    }

    /// Keeps exactly one main table rule when `needed`, none otherwise.
    async fn sync_main_rule(&self, family: Family, needed: bool) -> Result<()> {
        let rules = self.netlink.rule_list(family).await?;
        let existing: Vec<&RuleSpec> = rules.iter().filter(|r| r.is_main_suppress_rule()).collect();

        let keep = usize::from(needed);
        for extra in existing.iter().skip(keep) {
            self.netlink.rule_del(extra).await?;
        }
        if needed && existing.is_empty() {
            let priority = free_priority_above(&rules, self.cfg.advanced.rule_prio_offset)
                .ok_or_else(|| VpnError::InvalidData(format!("no free {family} rule priority")))?;
            self.netlink
                .rule_add(&RuleSpec::main_suppress(family, priority))
                .await?;
            debug!(%family, priority, "added main table rule");
        }
        Ok(())
    }
}

fn free_priority_below(rules: &[RuleSpec], start: u32) -> Option<u32> {
    let used: HashSet<u32> = rules.iter().map(|r| r.priority).collect();
    (1..=start).rev().find(|p| !used.contains(p))
}

fn free_priority_above(rules: &[RuleSpec], start: u32) -> Option<u32> {
    let used: HashSet<u32> = rules.iter().map(|r| r.priority).collect();
    (start.max(1)..FWMARK_RULE_BASE_PRIORITY).find(|p| !used.contains(p))
}
