//! Logical interface records.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use claw_wireguard::{
    BackendKind, InterfaceExtras, KeyPair, MikrotikInterfaceExtras, PhysicalInterface, PrivateKey,
    PublicKey,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::cidr;
use super::peer::Peer;
use crate::error::{Result, VpnError};

/// Role of an interface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    /// Accepts client peers.
    Server,
    /// Connects to a remote endpoint.
    Client,
    /// Role unknown, e.g. for imported devices.
    #[default]
    Any,
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Server => "server",
            Self::Client => "client",
            Self::Any => "any",
        })
    }
}

/// Parsed routing table selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoutingTable {
    /// Managed, table derived from the firewall mark.
    Auto,
    /// Route management explicitly disabled.
    Off,
    /// Managed with an explicit table.
    Table(u32),
}

impl RoutingTable {
    /// Parses `""`, `off`, decimal or `0x` hexadecimal table ids.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::Auto);
        }
        if raw.eq_ignore_ascii_case("off") {
            return Ok(Self::Off);
        }
        let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => raw.parse::<u32>(),
        };
        match parsed {
            Ok(0) => Ok(Self::Auto),
            Ok(table) if i32::try_from(table).is_ok() => Ok(Self::Table(table)),
            _ => Err(VpnError::InvalidData(format!("invalid routing table: {raw}"))),
        }
    }
}

/// Routing parameters handed to the route synchronizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingTableInfo {
    /// Interface identifier.
    pub interface: String,
    /// Firewall mark; zero lets the synchronizer allocate one.
    pub fw_mark: u32,
    /// Table selector.
    pub table: RoutingTable,
}

impl RoutingTableInfo {
    /// Whether routes should be managed at all.
    pub fn management_enabled(&self) -> bool {
        self.table != RoutingTable::Off
    }

    /// Effective table id; falls back to the mark.
    pub fn table_id(&self) -> u32 {
        match self.table {
            RoutingTable::Table(t) if t > 0 => t,
            _ => self.fw_mark,
        }
    }
}

impl fmt::Display for RoutingTableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: fwmark {}, table {}", self.interface, self.fw_mark, self.table_id())
    }
}

/// Settings seeded into every new peer of an interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerDefaults {
    /// Networks peer addresses are allocated from.
    pub network: Vec<IpNet>,
    /// DNS servers.
    pub dns_str: String,
    /// DNS search domains.
    pub dns_search_str: String,
    /// Endpoint peers connect to.
    pub endpoint: String,
    /// Allowed IPs pushed to peers.
    pub allowed_ips_str: String,
    /// Peer MTU.
    pub mtu: u32,
    /// Peer keepalive in seconds.
    pub persistent_keepalive: u16,
    /// Peer firewall mark.
    pub firewall_mark: u32,
    /// Peer routing table selector.
    pub routing_table: String,
    /// Peer pre-up hook.
    pub pre_up: String,
    /// Peer post-up hook.
    pub post_up: String,
    /// Peer pre-down hook.
    pub pre_down: String,
    /// Peer post-down hook.
    pub post_down: String,
}

/// Safe projection of an interface for non-admin callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacePublicInfo {
    /// Interface identifier.
    pub identifier: String,
    /// Display name.
    pub display_name: String,
    /// Role.
    pub interface_type: InterfaceType,
    /// Disabled timestamp.
    pub disabled: Option<DateTime<Utc>>,
}

/// A logical `WireGuard` interface, the desired state of one device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Interface {
    /// Device name, unique and immutable.
    pub identifier: String,
    /// Human readable name.
    pub display_name: String,
    /// Private key.
    pub private_key: Option<PrivateKey>,
    /// Public key.
    pub public_key: Option<PublicKey>,
    /// UDP listen port.
    pub listen_port: u16,
    /// Interface addresses.
    pub addresses: Vec<IpNet>,
    /// DNS servers set while the interface is up.
    pub dns_str: String,
    /// DNS search domains.
    pub dns_search_str: String,
    /// Device MTU.
    pub mtu: u32,
    /// Firewall mark; zero lets the route synchronizer pick one.
    pub firewall_mark: u32,
    /// Routing table selector: empty, `off`, or a table id.
    pub routing_table: String,
    /// Hook run before the interface comes up.
    pub pre_up: String,
    /// Hook run after the interface came up.
    pub post_up: String,
    /// Hook run before the interface goes down.
    pub pre_down: String,
    /// Hook run after the interface went down.
    pub post_down: String,
    /// Whether configuration files are written for this interface.
    pub save_config: bool,
    /// When the interface was disabled.
    pub disabled: Option<DateTime<Utc>>,
    /// Why the interface was disabled.
    pub disabled_reason: String,
    /// Role.
    pub interface_type: InterfaceType,
    /// Backend identifier; empty means local.
    pub backend: String,
    /// Device flavour reported by the backend.
    pub driver_type: String,
    /// Defaults seeded into peers.
    pub peer_defaults: PeerDefaults,
    /// Who created the record.
    pub created_by: String,
    /// Who last changed the record.
    pub updated_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl Interface {
    /// An empty enabled interface.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    /// Whether the interface carries a disabled timestamp.
    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    /// Disables the interface now.
    pub fn disable(&mut self, reason: &str) {
        self.disabled = Some(Utc::now());
        self.disabled_reason = reason.to_string();
    }

    /// Clears the disabled timestamp and reason.
    pub fn enable(&mut self) {
        self.disabled = None;
        self.disabled_reason.clear();
    }

    /// Key pair, if the private half is known.
    pub fn key_pair(&self) -> Option<KeyPair> {
        self.private_key.clone().map(KeyPair::from_private_key)
    }

    /// Sets both key halves.
    pub fn set_key_pair(&mut self, pair: &KeyPair) {
        self.private_key = Some(pair.private_key().clone());
        self.public_key = Some(*pair.public_key());
    }

    /// Checks invariants and normalizes derived fields.
    ///
    /// A peer default endpoint without a port gets the listen port appended.
    pub fn validate(&mut self) -> Result<()> {
        if self.identifier.trim().is_empty() {
            return Err(VpnError::InvalidData("interface identifier must not be empty".into()));
        }
        if let (Some(private), Some(public)) = (&self.private_key, &self.public_key) {
            KeyPair::from_parts(private.clone(), *public)
                .map_err(|_| VpnError::InvalidData("interface public key does not match private key".into()))?;
        }
        if let (Some(private), None) = (&self.private_key, &self.public_key) {
            self.public_key = Some(private.public_key());
        }
        RoutingTable::parse(&self.routing_table)?;

        let endpoint = self.peer_defaults.endpoint.trim();
        if !endpoint.is_empty() && !has_port(endpoint) {
            self.peer_defaults.endpoint = join_host_port(endpoint, self.listen_port);
        }
        Ok(())
    }

    /// Safe projection.
    pub fn public_info(&self) -> InterfacePublicInfo {
        InterfacePublicInfo {
            identifier: self.identifier.clone(),
            display_name: self.display_name.clone(),
            interface_type: self.interface_type,
            disabled: self.disabled,
        }
    }

    /// Parsed routing table selector. Unparseable values disable management.
    pub fn routing_table_selector(&self) -> RoutingTable {
        RoutingTable::parse(&self.routing_table).unwrap_or(RoutingTable::Off)
    }

    /// Whether the route synchronizer manages this interface.
    pub fn manage_routing_table(&self) -> bool {
        self.routing_table_selector() != RoutingTable::Off
    }

    /// Routing parameters for the route synchronizer.
    pub fn routing_info(&self) -> RoutingTableInfo {
        RoutingTableInfo {
            interface: self.identifier.clone(),
            fw_mark: self.firewall_mark,
            table: self.routing_table_selector(),
        }
    }

    /// Networks routed into this interface for the given peers.
    ///
    /// Each peer contributes its own addresses as host routes plus its extra
    /// allowed IPs.
    pub fn allowed_ips(&self, peers: &[Peer]) -> Vec<IpNet> {
        let mut out = Vec::new();
        for peer in peers {
            out.extend(peer.interface.addresses.iter().map(cidr::host_addr));
            if let Ok(extra) = cidr::parse_cidrs(&peer.extra_allowed_ips_str) {
                out.extend(extra);
            }
        }
        out
    }

    /// Builds a logical record from a device that is not in the database yet.
    pub fn from_physical(pi: &PhysicalInterface, backend: &str) -> Self {
        let networks: Vec<IpNet> = pi.addresses.iter().map(IpNet::trunc).collect();
        let mut iface = Self {
            identifier: pi.identifier.clone(),
            display_name: pi.identifier.clone(),
            private_key: pi.private_key.clone(),
            public_key: pi.public_key,
            listen_port: pi.listen_port,
            addresses: pi.addresses.clone(),
            mtu: pi.mtu,
            firewall_mark: pi.firewall_mark,
            interface_type: InterfaceType::Any,
            backend: backend.to_string(),
            driver_type: pi.device_type.clone(),
            peer_defaults: PeerDefaults {
                allowed_ips_str: cidr::join_cidrs(&networks),
                network: networks,
                mtu: pi.mtu,
                ..PeerDefaults::default()
            },
            ..Self::default()
        };
        if let Some(extras) = pi.mikrotik_extras() {
            if !extras.comment.is_empty() {
                iface.display_name.clone_from(&extras.comment);
            }
            if extras.disabled {
                iface.disable(super::reasons::ADMIN_DISABLED);
            }
        }
        iface
    }

    /// Writes the physical subset of this record onto `pi`.
    pub fn merge_to_physical(&self, pi: &mut PhysicalInterface) {
        pi.identifier.clone_from(&self.identifier);
        pi.private_key.clone_from(&self.private_key);
        pi.public_key = self.public_key;
        pi.listen_port = self.listen_port;
        pi.addresses.clone_from(&self.addresses);
        pi.mtu = self.mtu;
        // zero keeps a mark the route synchronizer allocated on the device
        if self.firewall_mark != 0 {
            pi.firewall_mark = self.firewall_mark;
        }
        pi.device_up = !self.is_disabled();

        if pi.import_source == BackendKind::Mikrotik || pi.mikrotik_extras().is_some() {
            let id = pi.mikrotik_extras().map(|e| e.id.clone()).unwrap_or_default();
            pi.extras = Some(InterfaceExtras::Mikrotik(MikrotikInterfaceExtras {
                id,
                comment: self.display_name.clone(),
                disabled: self.is_disabled(),
            }));
        }
    }

    /// Whether the device-relevant fields differ from `pi`.
    pub fn differs_from_physical(&self, pi: &PhysicalInterface) -> bool {
        pi.device_up == self.is_disabled()
            || pi.listen_port != self.listen_port
            || pi.mtu != self.mtu
            || (self.firewall_mark != 0 && pi.firewall_mark != self.firewall_mark)
            || pi.addresses != self.addresses
            || (self.public_key.is_some() && pi.public_key != self.public_key)
    }
}

/// Whether an endpoint string carries a port.
fn has_port(endpoint: &str) -> bool {
    if let Some(rest) = endpoint.strip_prefix('[') {
        return rest.contains("]:");
    }
    if endpoint.parse::<IpAddr>().is_ok_and(|a| a.is_ipv6()) {
        return false;
    }
    endpoint.contains(':')
}

/// Formats `host:port`, bracketing IPv6 literals.
fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
