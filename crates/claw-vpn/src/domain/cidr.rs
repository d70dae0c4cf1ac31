//! CIDR helpers shared by the domain model and the allocator.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{Result, VpnError};

/// Parses a comma separated CIDR list. Bare addresses become host routes.
pub fn parse_cidrs(list: &str) -> Result<Vec<IpNet>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_cidr)
        .collect()
}

/// Parses one CIDR or bare address.
pub fn parse_cidr(s: &str) -> Result<IpNet> {
    if let Ok(net) = s.parse::<IpNet>() {
        return Ok(net);
    }
    s.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| VpnError::InvalidData(format!("invalid CIDR: {s}")))
}

/// Joins CIDRs with `,`.
pub fn join_cidrs(nets: &[IpNet]) -> String {
    nets.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

/// The address of `net` as a single-host network (`/32` or `/128`).
pub fn host_addr(net: &IpNet) -> IpNet {
    IpNet::from(net.addr())
}

/// Whether `net` names a host rather than a whole network.
///
/// Full-length prefixes are hosts. Shorter prefixes are hosts when host bits
/// are set, e.g. `172.16.0.5/24`.
pub fn is_host_address(net: &IpNet) -> bool {
    net.prefix_len() == net.max_prefix_len() || net.addr() != net.network()
}

/// Splits `nets` into host and network addresses, keeping input order.
pub fn split_host_and_network(nets: &[IpNet]) -> (Vec<IpNet>, Vec<IpNet>) {
    nets.iter().partition(|n| is_host_address(n))
}

fn to_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u128::from(u32::from(a)),
        IpAddr::V6(a) => u128::from(a),
    }
}

fn with_addr(net: &IpNet, bits: u128) -> Option<IpNet> {
    match net {
        IpNet::V4(n) => {
            let v4 = u32::try_from(bits).ok()?;
            Ipv4Net::new(Ipv4Addr::from(v4), n.prefix_len()).ok().map(IpNet::V4)
        }
        IpNet::V6(n) => Ipv6Net::new(Ipv6Addr::from(bits), n.prefix_len()).ok().map(IpNet::V6),
    }
}

/// The next usable host address inside the same network, keeping the prefix.
///
/// Returns `None` when the network is exhausted. The IPv4 broadcast address
/// is never returned for prefixes shorter than `/31`.
pub fn next_addr(net: &IpNet) -> Option<IpNet> {
    let next = to_bits(net.addr()).checked_add(1)?;
    let candidate = with_addr(net, next)?;
    if !net.contains(&candidate.addr()) {
        return None;
    }
    if let IpNet::V4(n) = net {
        if n.prefix_len() < 31 && candidate.addr() == IpAddr::V4(n.broadcast()) {
            return None;
        }
    }
    Some(candidate)
}

/// The first usable host address of the network `net` belongs to.
pub fn first_host(net: &IpNet) -> Option<IpNet> {
    next_addr(&net.trunc())
}

/// The subnet of equal size directly after `net`.
pub fn next_subnet(net: &IpNet) -> Option<IpNet> {
    let size = 1u128.checked_shl(u32::from(net.max_prefix_len() - net.prefix_len()))?;
    let start = to_bits(net.network()).checked_add(size)?;
    with_addr(net, start).map(|n| n.trunc())
}
