use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;

use super::{Family, LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use crate::error::{Result, WireGuardError};

#[derive(Debug, Default)]
struct Tables {
    next_index: u32,
    links: BTreeMap<u32, LinkInfo>,
    addrs: BTreeMap<u32, Vec<IpNet>>,
    routes: Vec<RouteSpec>,
    rules: Vec<RuleSpec>,
}

/// Stateful in-memory kernel used by tests.
///
/// Route replacement is keyed by (table, destination) like the kernel.
/// Rules may be duplicated, as with `ip rule add`.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetlink {
    inner: Arc<Mutex<Tables>>,
}

impl MemoryNetlink {
    /// Creates an empty kernel with only the loopback link.
    #[must_use]
    pub fn new() -> Self {
        let ops = Self::default();
        ops.add_link("lo", None);
        ops
    }

    /// Adds a link and returns its index.
    pub fn add_link(&self, name: &str, kind: Option<&str>) -> u32 {
        let mut t = self.inner.lock();
        t.next_index += 1;
        let index = t.next_index;
        t.links.insert(
            index,
            LinkInfo {
                index,
                name: name.to_string(),
                kind: kind.map(str::to_string),
                mtu: 1500,
                up: false,
                rx_bytes: 0,
                tx_bytes: 0,
            },
        );
        index
    }

    /// Sets the traffic counters of a link.
    pub fn set_counters(&self, index: u32, rx_bytes: u64, tx_bytes: u64) {
        if let Some(link) = self.inner.lock().links.get_mut(&index) {
            link.rx_bytes = rx_bytes;
            link.tx_bytes = tx_bytes;
        }
    }

    /// Snapshot of all routes.
    #[must_use]
    pub fn routes(&self) -> Vec<RouteSpec> {
        self.inner.lock().routes.clone()
    }

    /// Snapshot of all rules.
    #[must_use]
    pub fn rules(&self) -> Vec<RuleSpec> {
        self.inner.lock().rules.clone()
    }

    /// Inserts a route without going through `route_replace`.
    pub fn seed_route(&self, route: RouteSpec) {
        self.inner.lock().routes.push(route);
    }

    /// Inserts a rule without going through `rule_add`.
    pub fn seed_rule(&self, rule: RuleSpec) {
        self.inner.lock().rules.push(rule);
    }
}

#[async_trait]
impl NetlinkOps for MemoryNetlink {
    async fn link_list(&self) -> Result<Vec<LinkInfo>> {
        Ok(self.inner.lock().links.values().cloned().collect())
    }

    async fn link_by_name(&self, name: &str) -> Result<LinkInfo> {
        self.inner
            .lock()
            .links
            .values()
            .find(|l| l.name == name)
            .cloned()
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))
    }

    async fn link_add_wireguard(&self, name: &str) -> Result<()> {
        if self.link_by_name(name).await.is_ok() {
            return Err(WireGuardError::Netlink(format!("link {name} exists")));
        }
        self.add_link(name, Some("wireguard"));
        Ok(())
    }

    async fn link_del(&self, index: u32) -> Result<()> {
        let mut t = self.inner.lock();
        let link = t
            .links
            .remove(&index)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(index.to_string()))?;
        t.addrs.remove(&link.index);
        t.routes.retain(|r| r.if_index != index);
        Ok(())
    }

    async fn link_set(&self, index: u32, up: bool, mtu: Option<u32>) -> Result<()> {
        let mut t = self.inner.lock();
        let link = t
            .links
            .get_mut(&index)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(index.to_string()))?;
        link.up = up;
        if let Some(mtu) = mtu {
            link.mtu = mtu;
        }
        Ok(())
    }

    async fn addr_list(&self, index: u32) -> Result<Vec<IpNet>> {
        Ok(self.inner.lock().addrs.get(&index).cloned().unwrap_or_default())
    }

    async fn addr_add(&self, index: u32, addr: IpNet) -> Result<()> {
        let mut t = self.inner.lock();
        let list = t.addrs.entry(index).or_default();
        if list.contains(&addr) {
            return Err(WireGuardError::Netlink(format!("address {addr} exists")));
        }
        list.push(addr);
        Ok(())
    }

    async fn addr_del(&self, index: u32, addr: IpNet) -> Result<()> {
        let mut t = self.inner.lock();
        if let Some(list) = t.addrs.get_mut(&index) {
            list.retain(|a| *a != addr);
        }
        Ok(())
    }

    async fn route_list(&self, family: Family, if_index: Option<u32>) -> Result<Vec<RouteSpec>> {
        Ok(self
            .inner
            .lock()
            .routes
            .iter()
            .filter(|r| r.family() == family)
            .filter(|r| if_index.is_none_or(|i| r.if_index == i))
            .cloned()
            .collect())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<()> {
        let mut t = self.inner.lock();
        t.routes
            .retain(|r| !(r.table == route.table && r.destination == route.destination));
        t.routes.push(route.clone());
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<()> {
        let mut t = self.inner.lock();
        let before = t.routes.len();
        t.routes.retain(|r| r != route);
        if t.routes.len() == before {
            return Err(WireGuardError::Netlink(format!(
                "no such route {} table {}",
                route.destination, route.table
            )));
        }
        Ok(())
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>> {
        Ok(self
            .inner
            .lock()
            .rules
            .iter()
            .filter(|r| r.family == family)
            .cloned()
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<()> {
        self.inner.lock().rules.push(rule.clone());
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<()> {
        let mut t = self.inner.lock();
        let pos = t
            .rules
            .iter()
            .position(|r| r == rule)
            .ok_or_else(|| WireGuardError::Netlink(format!("no such rule prio {}", rule.priority)))?;
        t.rules.remove(pos);
        Ok(())
    }
}
