//! Conflict-free addresses, ports and names for new interfaces and peers.
//!
//! Everything here is pure: callers fetch the used ranges from the repository
//! and pass them in.

use std::collections::HashMap;

use ipnet::IpNet;

use crate::domain::cidr;
use crate::error::{Result, VpnError};

const INTERFACE_NAME_PREFIX: &str = "wg";

/// First `wg<n>` not present in `existing`.
pub fn next_interface_name<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let taken: Vec<&str> = existing.into_iter().collect();
    (0u32..)
        .map(|n| format!("{INTERFACE_NAME_PREFIX}{n}"))
        .find(|name| !taken.contains(&name.as_str()))
        .unwrap_or_else(|| INTERFACE_NAME_PREFIX.to_string())
}

/// First port at or above `start` not present in `used`.
pub fn fresh_listen_port(start: u16, used: &[u16]) -> Result<u16> {
    (start..=u16::MAX)
        .find(|port| !used.contains(port))
        .ok_or_else(|| VpnError::InvalidData("port space exhausted".to_string()))
}

/// Interface addresses in the first networks, starting at `start_v4` and
/// `start_v6`, that no used address falls into.
///
/// Conflicting networks advance to the next subnet of the same size. The
/// result is the first host address of the chosen network.
pub fn fresh_interface_addresses(
    start_v4: IpNet,
    start_v6: Option<IpNet>,
    used: &[IpNet],
) -> Result<(IpNet, Option<IpNet>)> {
    let conflicts = |net: &IpNet| used.iter().any(|u| u.trunc() == *net || net.contains(&u.addr()));

    let mut v4 = start_v4.trunc();
    while conflicts(&v4) {
        v4 = cidr::next_subnet(&v4)
            .ok_or_else(|| VpnError::InvalidData("IPv4 space exhausted".to_string()))?;
    }
    let v4 = cidr::first_host(&v4)
        .ok_or_else(|| VpnError::InvalidData(format!("network {v4} has no host addresses")))?;

    let v6 = match start_v6 {
        Some(start) => {
            let mut net = start.trunc();
            while conflicts(&net) {
                net = cidr::next_subnet(&net)
                    .ok_or_else(|| VpnError::InvalidData("IPv6 space exhausted".to_string()))?;
            }
            Some(cidr::first_host(&net).ok_or_else(|| {
                VpnError::InvalidData(format!("network {net} has no host addresses"))
            })?)
        }
        None => None,
    };
    Ok((v4, v6))
}

/// One unused host address per network in `networks`.
///
/// `used` maps a network to the addresses already taken inside it. An
/// exhausted network is an error.
pub fn fresh_peer_addresses(
    networks: &[IpNet],
    used: &HashMap<IpNet, Vec<IpNet>>,
) -> Result<Vec<IpNet>> {
    let mut out = Vec::with_capacity(networks.len());
    for network in networks {
        let network = network.trunc();
        let taken = used.get(&network).map(Vec::as_slice).unwrap_or_default();
        let is_taken = |ip: &IpNet| taken.iter().any(|u| u.addr() == ip.addr());

        let exhausted = || VpnError::InvalidData(format!("ip space on subnet {network} is exhausted"));
        let mut ip = cidr::first_host(&network).ok_or_else(exhausted)?;
        while is_taken(&ip) {
            ip = cidr::next_addr(&ip).ok_or_else(exhausted)?;
        }
        out.push(ip);
    }
    Ok(out)
}

/// Groups `addresses` by the network of each configured subnet they fall in.
pub fn group_by_subnet(
    subnets: &[IpNet],
    addresses: impl IntoIterator<Item = IpNet>,
) -> HashMap<IpNet, Vec<IpNet>> {
    let mut grouped: HashMap<IpNet, Vec<IpNet>> =
        subnets.iter().map(|s| (s.trunc(), Vec::new())).collect();
    for addr in addresses {
        for (subnet, members) in &mut grouped {
            if subnet.contains(&addr.addr()) {
                members.push(addr);
            }
        }
    }
    grouped
}
