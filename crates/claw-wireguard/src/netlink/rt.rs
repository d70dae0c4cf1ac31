//! [`NetlinkOps`] backed by an `rtnetlink::Handle`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::IpNet;
use rtnetlink::packet_route::address::AddressAttribute;
use rtnetlink::packet_route::link::{InfoKind, LinkAttribute, LinkFlags, LinkInfo as NlLinkInfo};
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteScope, RouteType,
};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleFlags, RuleMessage};
use rtnetlink::{IpVersion, LinkUnspec, LinkWireguard, RouteMessageBuilder};
use tracing::debug;

use super::{Family, LinkInfo, NetlinkOps, RouteSpec, RuleSpec};
use crate::error::{Result, WireGuardError};

impl From<rtnetlink::Error> for WireGuardError {
    fn from(e: rtnetlink::Error) -> Self {
        Self::Netlink(e.to_string())
    }
}

/// Production [`NetlinkOps`].
#[derive(Clone)]
pub struct RtNetlinkOps {
    handle: rtnetlink::Handle,
}

impl RtNetlinkOps {
    /// Opens a netlink socket and spawns its connection task.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be opened.
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Wraps an existing handle.
    #[must_use]
    pub fn new(handle: rtnetlink::Handle) -> Self {
        Self { handle }
    }

    fn ip_version(family: Family) -> IpVersion {
        match family {
            Family::V4 => IpVersion::V4,
            Family::V6 => IpVersion::V6,
        }
    }

    fn build_route_message(spec: &RouteSpec) -> RouteMessage {
        match spec.destination {
            IpNet::V4(net) => RouteMessageBuilder::<Ipv4Addr>::default()
                .destination_prefix(net.network(), net.prefix_len())
                .output_interface(spec.if_index)
                .table_id(spec.table)
                .scope(RouteScope::Link)
                .kind(RouteType::Unicast)
                .build(),
            IpNet::V6(net) => RouteMessageBuilder::<Ipv6Addr>::default()
                .destination_prefix(net.network(), net.prefix_len())
                .output_interface(spec.if_index)
                .table_id(spec.table)
                .scope(RouteScope::Link)
                .kind(RouteType::Unicast)
                .build(),
        }
    }

    fn route_message_to_spec(family: Family, msg: &RouteMessage) -> Option<RouteSpec> {
        if msg.header.scope != RouteScope::Link || msg.header.kind != RouteType::Unicast {
            return None;
        }
        let if_index = msg.attributes.iter().find_map(|a| match a {
            RouteAttribute::Oif(idx) => Some(*idx),
            _ => None,
        })?;
        let table = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Table(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| u32::from(msg.header.table));
        let prefix = msg.header.destination_prefix_length;

        // a route without destination is the family's default route
        let destination = msg
            .attributes
            .iter()
            .find_map(|a| match a {
                RouteAttribute::Destination(RouteAddress::Inet(ip)) => {
                    IpNet::new(IpAddr::V4(*ip), prefix).ok()
                }
                RouteAttribute::Destination(RouteAddress::Inet6(ip)) => {
                    IpNet::new(IpAddr::V6(*ip), prefix).ok()
                }
                _ => None,
            })
            .unwrap_or_else(|| family.default_route());

        Some(RouteSpec { destination, if_index, table })
    }

    fn rule_message_to_spec(family: Family, msg: &RuleMessage) -> RuleSpec {
        let mut spec = RuleSpec {
            family,
            priority: 0,
            fw_mark: None,
            table: u32::from(msg.header.table),
            invert: msg.header.flags.contains(RuleFlags::Invert),
            suppress_prefixlen: None,
        };
        for attr in &msg.attributes {
            match attr {
                RuleAttribute::Priority(p) => spec.priority = *p,
                RuleAttribute::FwMark(m) => spec.fw_mark = Some(*m),
                RuleAttribute::Table(t) => spec.table = *t,
                RuleAttribute::SuppressPrefixLen(l) => spec.suppress_prefixlen = Some(*l),
                _ => {}
            }
        }
        spec
    }

    async fn rule_messages(&self, family: Family) -> Result<Vec<RuleMessage>> {
        let rules: Vec<_> = self
            .handle
            .rule()
            .get(Self::ip_version(family))
            .execute()
            .try_collect()
            .await?;
        Ok(rules)
    }

    fn link_message_to_info(msg: &rtnetlink::packet_route::link::LinkMessage) -> Option<LinkInfo> {
        let mut info = LinkInfo {
            index: msg.header.index,
            up: msg.header.flags.contains(LinkFlags::Up),
            ..LinkInfo::default()
        };
        let mut named = false;
        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(n) => {
                    info.name.clone_from(n);
                    named = true;
                }
                LinkAttribute::Mtu(m) => info.mtu = *m,
                LinkAttribute::Stats64(s) => {
                    info.rx_bytes = s.rx_bytes;
                    info.tx_bytes = s.tx_bytes;
                }
                LinkAttribute::LinkInfo(infos) => {
                    info.kind = infos.iter().find_map(|i| match i {
                        NlLinkInfo::Kind(InfoKind::Wireguard) => Some("wireguard".to_string()),
                        NlLinkInfo::Kind(other) => Some(other.to_string().to_lowercase()),
                        _ => None,
                    });
                }
                _ => {}
            }
        }
        named.then_some(info)
    }
}

#[async_trait]
impl NetlinkOps for RtNetlinkOps {
    async fn link_list(&self) -> Result<Vec<LinkInfo>> {
        let links: Vec<_> = self.handle.link().get().execute().try_collect().await?;
        Ok(links.iter().filter_map(Self::link_message_to_info).collect())
    }

    async fn link_by_name(&self, name: &str) -> Result<LinkInfo> {
        let links: Vec<_> = match self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_collect()
            .await
        {
            Ok(links) => links,
            // ENODEV comes back as an error, not an empty dump
            Err(rtnetlink::Error::NetlinkError(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        links
            .iter()
            .find_map(Self::link_message_to_info)
            .ok_or_else(|| WireGuardError::InterfaceNotFound(name.to_string()))
    }

    async fn link_add_wireguard(&self, name: &str) -> Result<()> {
        debug!(interface = %name, "adding wireguard link");
        self.handle
            .link()
            .add(LinkWireguard::new(name).build())
            .execute()
            .await?;
        Ok(())
    }

    async fn link_del(&self, index: u32) -> Result<()> {
        self.handle.link().del(index).execute().await?;
        Ok(())
    }

    async fn link_set(&self, index: u32, up: bool, mtu: Option<u32>) -> Result<()> {
        let mut builder = LinkUnspec::new_with_index(index);
        builder = if up { builder.up() } else { builder.down() };
        if let Some(mtu) = mtu {
            builder = builder.mtu(mtu);
        }
        self.handle.link().set(builder.build()).execute().await?;
        Ok(())
    }

    async fn addr_list(&self, index: u32) -> Result<Vec<IpNet>> {
        let addrs: Vec<_> = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await?;
        Ok(addrs
            .iter()
            .filter_map(|msg| {
                let ip = msg.attributes.iter().find_map(|a| match a {
                    AddressAttribute::Address(ip) => Some(*ip),
                    _ => None,
                })?;
                IpNet::new(ip, msg.header.prefix_len).ok()
            })
            .collect())
    }

    async fn addr_add(&self, index: u32, addr: IpNet) -> Result<()> {
        self.handle
            .address()
            .add(index, addr.addr(), addr.prefix_len())
            .execute()
            .await?;
        Ok(())
    }

    async fn addr_del(&self, index: u32, addr: IpNet) -> Result<()> {
        let addrs: Vec<_> = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await?;
        for msg in addrs {
            let matches = msg.header.prefix_len == addr.prefix_len()
                && msg
                    .attributes
                    .iter()
                    .any(|a| matches!(a, AddressAttribute::Address(ip) if *ip == addr.addr()));
            if matches {
                self.handle.address().del(msg).execute().await?;
            }
        }
        Ok(())
    }

    async fn route_list(&self, family: Family, if_index: Option<u32>) -> Result<Vec<RouteSpec>> {
        let filter = match family {
            Family::V4 => RouteMessageBuilder::<Ipv4Addr>::default().build(),
            Family::V6 => RouteMessageBuilder::<Ipv6Addr>::default().build(),
        };
        let routes: Vec<_> = self.handle.route().get(filter).execute().try_collect().await?;
        Ok(routes
            .iter()
            .filter_map(|m| Self::route_message_to_spec(family, m))
            .filter(|r| if_index.is_none_or(|i| r.if_index == i))
            .collect())
    }

    async fn route_replace(&self, route: &RouteSpec) -> Result<()> {
        let msg = Self::build_route_message(route);
        self.handle.route().add(msg).replace().execute().await?;
        Ok(())
    }

    async fn route_del(&self, route: &RouteSpec) -> Result<()> {
        let msg = Self::build_route_message(route);
        self.handle.route().del(msg).execute().await?;
        Ok(())
    }

    async fn rule_list(&self, family: Family) -> Result<Vec<RuleSpec>> {
        let rules = self.rule_messages(family).await?;
        Ok(rules
            .iter()
            .map(|m| Self::rule_message_to_spec(family, m))
            .collect())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<()> {
        let request = self.handle.rule().add();
        let mut request = match rule.family {
            Family::V4 => request.v4(),
            Family::V6 => request.v6(),
        }
        .priority(rule.priority)
        .table_id(rule.table)
        .action(RuleAction::ToTable);

        if let Some(mark) = rule.fw_mark {
            request = request.fw_mark(mark);
        }
        let msg = request.message_mut();
        if rule.invert {
            msg.header.flags |= RuleFlags::Invert;
        }
        if let Some(len) = rule.suppress_prefixlen {
            msg.attributes.push(RuleAttribute::SuppressPrefixLen(len));
        }
        request.execute().await?;
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<()> {
        for msg in self.rule_messages(rule.family).await? {
            if Self::rule_message_to_spec(rule.family, &msg) == *rule {
                self.handle.rule().del(msg).execute().await?;
                return Ok(());
            }
        }
        Err(WireGuardError::Netlink(format!(
            "rule not found: prio {} table {}",
            rule.priority, rule.table
        )))
    }
}
