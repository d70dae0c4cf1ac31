//! Abstraction over kernel link, address, route and rule operations.
//!
//! [`NetlinkOps`] decouples the kernel backend and the policy routing logic
//! from the rtnetlink wire format. Production code uses `RtNetlinkOps`
//! (feature `linux`); tests use [`MemoryNetlink`].

mod memory;
#[cfg(feature = "linux")]
mod rt;

use std::fmt;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryNetlink;
#[cfg(feature = "linux")]
pub use rt::RtNetlinkOps;

/// Kernel id of the main routing table.
pub const MAIN_TABLE: u32 = 254;

/// Address family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl Family {
    /// Both families, v4 first.
    pub const ALL: [Self; 2] = [Self::V4, Self::V6];

    /// Family of a network.
    #[must_use]
    pub const fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }

    /// The default route of this family.
    #[must_use]
    pub fn default_route(self) -> IpNet {
        match self {
            Self::V4 => IpNet::V4(ipnet::Ipv4Net::default()),
            Self::V6 => IpNet::V6(ipnet::Ipv6Net::default()),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::V4 => "ipv4",
            Self::V6 => "ipv6",
        })
    }
}

/// A link-scoped unicast route.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Destination network; `0.0.0.0/0` or `::/0` for default routes.
    pub destination: IpNet,
    /// Output interface index.
    pub if_index: u32,
    /// Routing table.
    pub table: u32,
}

impl RouteSpec {
    /// Family of the destination.
    #[must_use]
    pub const fn family(&self) -> Family {
        Family::of(&self.destination)
    }
}

/// A policy routing rule.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Address family.
    pub family: Family,
    /// Rule priority.
    pub priority: u32,
    /// Firewall mark selector.
    pub fw_mark: Option<u32>,
    /// Lookup table.
    pub table: u32,
    /// `not` selector.
    pub invert: bool,
    /// `suppress_prefixlength` option.
    pub suppress_prefixlen: Option<u32>,
}

impl RuleSpec {
    /// `not fwmark <mark> lookup <table>`.
    #[must_use]
    pub const fn fwmark(family: Family, fw_mark: u32, table: u32, priority: u32) -> Self {
        Self {
            family,
            priority,
            fw_mark: Some(fw_mark),
            table,
            invert: true,
            suppress_prefixlen: None,
        }
    }

    /// `lookup main suppress_prefixlength 0`.
    #[must_use]
    pub const fn main_suppress(family: Family, priority: u32) -> Self {
        Self {
            family,
            priority,
            fw_mark: None,
            table: MAIN_TABLE,
            invert: false,
            suppress_prefixlen: Some(0),
        }
    }

    /// Whether this is an inverted fwmark rule for `mark` and `table`.
    #[must_use]
    pub fn is_fwmark_rule(&self, mark: u32, table: u32) -> bool {
        self.fw_mark == Some(mark) && self.table == table && self.invert
    }

    /// Whether this is a main table suppress rule.
    #[must_use]
    pub fn is_main_suppress_rule(&self) -> bool {
        self.table == MAIN_TABLE && self.suppress_prefixlen == Some(0)
    }
}

/// Kernel view of a network link.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
    /// Link kind, e.g. `wireguard`.
    pub kind: Option<String>,
    /// Link MTU.
    pub mtu: u32,
    /// Administrative state.
    pub up: bool,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
}

impl LinkInfo {
    /// Whether the link is a `WireGuard` device.
    #[must_use]
    pub fn is_wireguard(&self) -> bool {
        self.kind.as_deref() == Some("wireguard")
    }
}

/// Kernel link, address, route and rule operations.
#[async_trait]
pub trait NetlinkOps: Send + Sync {
    /// All links.
    async fn link_list(&self) -> Result<Vec<LinkInfo>>;

    /// One link by name; a missing link is a not-exist error.
    async fn link_by_name(&self, name: &str) -> Result<LinkInfo>;

    /// Creates a `WireGuard` link.
    async fn link_add_wireguard(&self, name: &str) -> Result<()>;

    /// Deletes a link.
    async fn link_del(&self, index: u32) -> Result<()>;

    /// Sets administrative state and, when given, the MTU.
    async fn link_set(&self, index: u32, up: bool, mtu: Option<u32>) -> Result<()>;

    /// Addresses assigned to a link.
    async fn addr_list(&self, index: u32) -> Result<Vec<IpNet>>;

    /// Assigns an address.
    async fn addr_add(&self, index: u32, addr: IpNet) -> Result<()>;

    /// Removes an address.
    async fn addr_del(&self, index: u32, addr: IpNet) -> Result<()>;

    /// Link-scoped unicast routes of `family`, optionally limited to one link.
    async fn route_list(&self, family: Family, if_index: Option<u32>) -> Result<Vec<RouteSpec>>;

    /// Adds or replaces a route.
    async fn route_replace(&self, route: &RouteSpec) -> Result<()>;

    /// Deletes a route.
    async fn route_del(&self, route: &RouteSpec) -> Result<()>;

    /// Rules of `family`.
    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>>;

    /// Adds a rule.
    async fn rule_add(&self, rule: &RuleSpec) -> Result<()>;

    /// Deletes a rule.
    async fn rule_del(&self, rule: &RuleSpec) -> Result<()>;
}
