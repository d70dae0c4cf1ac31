//! Logical peer records.

use chrono::{DateTime, Utc};
use claw_wireguard::{
    BackendKind, KeyPair, LocalPeerExtras, MikrotikPeerExtras, PeerExtras, PhysicalPeer,
    PresharedKey, PrivateKey, PublicKey,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::cidr;
use super::interface::{Interface, InterfaceType};
use super::options::ConfigOption;
use super::reasons;

/// Peer-side interface settings, i.e. what ends up in the peer's own config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInterfaceConfig {
    /// Peer private key; unknown for imported peers.
    pub private_key: Option<PrivateKey>,
    /// Peer public key.
    pub public_key: PublicKey,
    /// Role of the peer's own interface.
    pub peer_type: InterfaceType,
    /// Addresses assigned to the peer.
    pub addresses: Vec<IpNet>,
    /// Address probed by liveness checks; empty means the first address.
    pub check_alive_address: String,
    /// DNS servers.
    pub dns_str: ConfigOption<String>,
    /// DNS search domains.
    pub dns_search_str: ConfigOption<String>,
    /// MTU.
    pub mtu: ConfigOption<u32>,
    /// Firewall mark.
    pub firewall_mark: ConfigOption<u32>,
    /// Routing table selector.
    pub routing_table: ConfigOption<String>,
    /// Pre-up hook.
    pub pre_up: ConfigOption<String>,
    /// Post-up hook.
    pub post_up: ConfigOption<String>,
    /// Pre-down hook.
    pub pre_down: ConfigOption<String>,
    /// Post-down hook.
    pub post_down: ConfigOption<String>,
}

impl PeerInterfaceConfig {
    fn new(public_key: PublicKey) -> Self {
        Self {
            private_key: None,
            public_key,
            peer_type: InterfaceType::Any,
            addresses: Vec::new(),
            check_alive_address: String::new(),
            dns_str: ConfigOption::new(String::new(), true),
            dns_search_str: ConfigOption::new(String::new(), true),
            mtu: ConfigOption::new(0, true),
            firewall_mark: ConfigOption::new(0, true),
            routing_table: ConfigOption::new(String::new(), true),
            pre_up: ConfigOption::new(String::new(), true),
            post_up: ConfigOption::new(String::new(), true),
            pre_down: ConfigOption::new(String::new(), true),
            post_down: ConfigOption::new(String::new(), true),
        }
    }
}

/// A logical `WireGuard` peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Base64 public key.
    pub identifier: String,
    /// Human readable name.
    pub display_name: String,
    /// Owning user; empty for admin-only peers.
    pub user_identifier: String,
    /// Interface the peer belongs to.
    pub interface_identifier: String,
    /// Endpoint the peer connects to.
    pub endpoint: ConfigOption<String>,
    /// Public key of the endpoint.
    pub endpoint_public_key: ConfigOption<String>,
    /// Allowed IPs of the peer's own config.
    pub allowed_ips_str: ConfigOption<String>,
    /// Networks routed to the peer on the interface side only.
    pub extra_allowed_ips_str: String,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// Keepalive in seconds.
    pub persistent_keepalive: ConfigOption<u16>,
    /// When the peer was disabled.
    pub disabled: Option<DateTime<Utc>>,
    /// Why the peer was disabled.
    pub disabled_reason: String,
    /// When the peer stops being valid.
    pub expires_at: Option<DateTime<Utc>>,
    /// Free-form notes.
    pub notes: String,
    /// Created by default peer provisioning.
    pub automatically_created: bool,
    /// Peer-side interface settings.
    pub interface: PeerInterfaceConfig,
    /// Who created the record.
    pub created_by: String,
    /// Who last changed the record.
    pub updated_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

impl Peer {
    /// An empty enabled peer on `interface`.
    pub fn new(public_key: PublicKey, interface: impl Into<String>) -> Self {
        Self {
            identifier: public_key.to_base64(),
            display_name: String::new(),
            user_identifier: String::new(),
            interface_identifier: interface.into(),
            endpoint: ConfigOption::new(String::new(), true),
            endpoint_public_key: ConfigOption::new(String::new(), true),
            allowed_ips_str: ConfigOption::new(String::new(), true),
            extra_allowed_ips_str: String::new(),
            preshared_key: None,
            persistent_keepalive: ConfigOption::new(0, true),
            disabled: None,
            disabled_reason: String::new(),
            expires_at: None,
            notes: String::new(),
            automatically_created: false,
            interface: PeerInterfaceConfig::new(public_key),
            created_by: String::new(),
            updated_by: String::new(),
            created_at: DateTime::default(),
            updated_at: DateTime::default(),
        }
    }

    /// Whether the peer carries a disabled timestamp.
    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    /// Disables the peer now.
    pub fn disable(&mut self, reason: &str) {
        self.disabled = Some(Utc::now());
        self.disabled_reason = reason.to_string();
    }

    /// Clears the disabled timestamp and reason.
    pub fn enable(&mut self) {
        self.disabled = None;
        self.disabled_reason.clear();
    }

    /// Whether the expiry time has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at < Utc::now())
    }

    /// Key pair, if the private half is known.
    pub fn key_pair(&self) -> Option<KeyPair> {
        self.interface
            .private_key
            .clone()
            .map(KeyPair::from_private_key)
    }

    /// Sets both key halves and the identifier.
    pub fn set_key_pair(&mut self, pair: &KeyPair) {
        self.interface.private_key = Some(pair.private_key().clone());
        self.interface.public_key = *pair.public_key();
        self.identifier = pair.public_key().to_base64();
    }

    /// Address probed by liveness checks, without prefix.
    pub fn check_alive_address(&self) -> String {
        if !self.interface.check_alive_address.is_empty() {
            return self.interface.check_alive_address.clone();
        }
        self.interface
            .addresses
            .first()
            .map(|a| a.addr().to_string())
            .unwrap_or_default()
    }

    /// Copies interface defaults into every overridable option.
    pub fn apply_interface_defaults(&mut self, iface: &Interface) {
        let pd = &iface.peer_defaults;
        self.endpoint.try_set(pd.endpoint.clone());
        self.endpoint_public_key
            .try_set(iface.public_key.map(|k| k.to_base64()).unwrap_or_default());
        self.allowed_ips_str.try_set(pd.allowed_ips_str.clone());
        self.persistent_keepalive.try_set(pd.persistent_keepalive);
        self.interface.dns_str.try_set(pd.dns_str.clone());
        self.interface.dns_search_str.try_set(pd.dns_search_str.clone());
        self.interface.mtu.try_set(pd.mtu);
        self.interface.firewall_mark.try_set(pd.firewall_mark);
        self.interface.routing_table.try_set(pd.routing_table.clone());
        self.interface.pre_up.try_set(pd.pre_up.clone());
        self.interface.post_up.try_set(pd.post_up.clone());
        self.interface.pre_down.try_set(pd.pre_down.clone());
        self.interface.post_down.try_set(pd.post_down.clone());
    }

    /// Sets the display name to `[<prefix> ]Peer <first 8 chars of id>`.
    pub fn generate_display_name(&mut self, prefix: &str) {
        let short: String = self.identifier.chars().take(8).collect();
        let prefix = prefix.trim();
        self.display_name = if prefix.is_empty() {
            format!("Peer {short}")
        } else {
            format!("{prefix} Peer {short}")
        };
    }

    /// Takes the fields an owner may edit from `user_peer`.
    ///
    /// Key material is only taken when `editable_keys` is set.
    pub fn overwrite_user_editable_fields(&mut self, user_peer: &Self, editable_keys: bool) {
        self.display_name.clone_from(&user_peer.display_name);
        if editable_keys {
            self.interface.public_key = user_peer.interface.public_key;
            self.interface.private_key.clone_from(&user_peer.interface.private_key);
            self.preshared_key.clone_from(&user_peer.preshared_key);
            self.identifier.clone_from(&user_peer.identifier);
        }
        self.interface.mtu = user_peer.interface.mtu.clone();
        self.persistent_keepalive = user_peer.persistent_keepalive.clone();
        self.expires_at = user_peer.expires_at;
        self.disabled = user_peer.disabled;
        self.disabled_reason.clone_from(&user_peer.disabled_reason);
    }

    /// Effective allowed IPs on the interface side.
    ///
    /// Server peers route their configured allowed IPs; all others route
    /// their own addresses as host routes. Extra allowed IPs are appended.
    pub fn physical_allowed_ips(&self) -> Vec<IpNet> {
        let mut out: Vec<IpNet> = if self.interface.peer_type == InterfaceType::Server {
            cidr::parse_cidrs(self.allowed_ips_str.get()).unwrap_or_default()
        } else {
            self.interface.addresses.iter().map(cidr::host_addr).collect()
        };
        out.extend(cidr::parse_cidrs(&self.extra_allowed_ips_str).unwrap_or_default());
        out
    }

    /// Builds a logical record from a device peer.
    ///
    /// The device's allowed IPs are split: host addresses become the peer's
    /// own addresses, whole networks become extra allowed IPs.
    pub fn from_physical(pp: &PhysicalPeer, interface: &str) -> Self {
        let mut peer = Self::new(pp.public_key, interface);
        peer.display_name = peer.identifier.clone();
        peer.endpoint = ConfigOption::new(pp.endpoint.clone(), true);
        peer.preshared_key.clone_from(&pp.preshared_key);
        peer.persistent_keepalive = ConfigOption::new(pp.persistent_keepalive, true);
        peer.interface.private_key.clone_from(&pp.private_key);

        let (hosts, networks) = cidr::split_host_and_network(&pp.allowed_ips);
        peer.interface.addresses = hosts;
        peer.extra_allowed_ips_str = cidr::join_cidrs(&networks);

        match &pp.extras {
            Some(PeerExtras::Mikrotik(extras)) => {
                peer.notes.clone_from(&extras.comment);
                if !extras.name.is_empty() {
                    peer.display_name.clone_from(&extras.name);
                }
                if extras.client_endpoint.is_empty() {
                    peer.interface.peer_type = InterfaceType::Server;
                } else {
                    peer.endpoint = ConfigOption::new(extras.client_endpoint.clone(), true);
                    peer.interface.peer_type = InterfaceType::Client;
                    if let Ok(addresses) = cidr::parse_cidrs(&extras.client_address) {
                        if !addresses.is_empty() {
                            peer.interface.addresses = addresses;
                        }
                    }
                    peer.interface.dns_str = ConfigOption::new(extras.client_dns.clone(), true);
                    peer.persistent_keepalive = ConfigOption::new(extras.client_keepalive, true);
                }
                if extras.disabled {
                    peer.disable(reasons::BACKEND_DISABLED);
                }
            }
            Some(PeerExtras::Local(extras)) => {
                if extras.disabled {
                    peer.disable(reasons::BACKEND_DISABLED);
                }
            }
            None => {}
        }
        peer
    }

    /// Writes the physical subset of this record onto `pp`.
    pub fn merge_to_physical(&self, pp: &mut PhysicalPeer) {
        pp.public_key = self.interface.public_key;
        pp.endpoint.clone_from(self.endpoint.get());
        pp.allowed_ips = self.physical_allowed_ips();
        pp.preshared_key.clone_from(&self.preshared_key);
        pp.persistent_keepalive = *self.persistent_keepalive.get();

        match pp.import_source {
            BackendKind::Mikrotik => {
                let id = pp.mikrotik_extras().map(|e| e.id.clone()).unwrap_or_default();
                pp.extras = Some(PeerExtras::Mikrotik(MikrotikPeerExtras {
                    id,
                    name: self.display_name.clone(),
                    comment: self.notes.clone(),
                    is_responder: self.interface.peer_type == InterfaceType::Client,
                    disabled: self.is_disabled(),
                    client_endpoint: self.endpoint.get().clone(),
                    client_address: cidr::join_cidrs(&self.interface.addresses),
                    client_dns: self.interface.dns_str.get().clone(),
                    client_keepalive: *self.persistent_keepalive.get(),
                }));
            }
            BackendKind::Local => {
                pp.extras = Some(PeerExtras::Local(LocalPeerExtras {
                    disabled: self.is_disabled(),
                }));
            }
            BackendKind::Memory => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn net(s: &str) -> IpNet {
        s.parse().expect("cidr")
    }

    fn peer() -> Peer {
        Peer::new(*KeyPair::generate().public_key(), "wg0")
    }

    #[test]
    fn identifier_is_public_key() {
        let pair = KeyPair::generate();
        let p = Peer::new(*pair.public_key(), "wg0");
        assert_eq!(p.identifier, pair.public_key().to_base64());
    }

    #[test]
    fn expiry() {
        let mut p = peer();
        assert!(!p.is_expired());
        p.expires_at = Some(Utc::now() - Duration::minutes(1));
        assert!(p.is_expired());
        p.expires_at = Some(Utc::now() + Duration::hours(1));
        assert!(!p.is_expired());
    }

    #[test]
    fn check_alive_address_prefers_explicit() {
        let mut p = peer();
        assert_eq!(p.check_alive_address(), "");
        p.interface.addresses = vec![net("10.0.0.2/24"), net("fd00::2/64")];
        assert_eq!(p.check_alive_address(), "10.0.0.2");
        p.interface.check_alive_address = "1.1.1.1".into();
        assert_eq!(p.check_alive_address(), "1.1.1.1");
    }

    #[test]
    fn defaults_respect_overridable() {
        let mut iface = Interface::new("wg0");
        iface.peer_defaults.endpoint = "vpn.example.com:51820".into();
        iface.peer_defaults.persistent_keepalive = 16;
        iface.peer_defaults.mtu = 1420;

        let mut p = peer();
        p.persistent_keepalive = ConfigOption::new(25, false);
        p.apply_interface_defaults(&iface);

        assert_eq!(p.endpoint.get(), "vpn.example.com:51820");
        assert_eq!(*p.persistent_keepalive.get(), 25);
        assert_eq!(*p.interface.mtu.get(), 1420);
    }

    #[test]
    fn display_name_uses_key_prefix() {
        let mut p = peer();
        let short: String = p.identifier.chars().take(8).collect();
        p.generate_display_name("");
        assert_eq!(p.display_name, format!("Peer {short}"));
        p.generate_display_name(" Office ");
        assert_eq!(p.display_name, format!("Office Peer {short}"));
    }

    #[test]
    fn import_splits_host_and_network_addresses() {
        let mut pp = PhysicalPeer::new(*KeyPair::generate().public_key());
        pp.allowed_ips = cidr::parse_cidrs(
            "10.0.0.1/32, 192.168.1.0/24, 172.16.0.5/24, fd00::1/128, fd00:1::/64",
        )
        .expect("parse");

        let p = Peer::from_physical(&pp, "wg0");
        assert_eq!(
            p.interface.addresses,
            vec![net("10.0.0.1/32"), net("172.16.0.5/24"), net("fd00::1/128")]
        );
        assert_eq!(p.extra_allowed_ips_str, "192.168.1.0/24,fd00:1::/64");
    }

    #[test]
    fn physical_allowed_ips_by_type() {
        let mut p = peer();
        p.interface.addresses = vec![net("10.0.0.5/24")];
        p.allowed_ips_str = ConfigOption::new("0.0.0.0/0".into(), true);
        p.extra_allowed_ips_str = "192.168.7.0/24".into();

        p.interface.peer_type = InterfaceType::Client;
        assert_eq!(p.physical_allowed_ips(), vec![net("10.0.0.5/32"), net("192.168.7.0/24")]);

        p.interface.peer_type = InterfaceType::Server;
        assert_eq!(p.physical_allowed_ips(), vec![net("0.0.0.0/0"), net("192.168.7.0/24")]);
    }

    #[test]
    fn mikrotik_round_trip_keeps_device_id() {
        let mut pp = PhysicalPeer::new(*KeyPair::generate().public_key());
        pp.import_source = BackendKind::Mikrotik;
        pp.extras = Some(PeerExtras::Mikrotik(MikrotikPeerExtras {
            id: "*3".into(),
            name: "laptop".into(),
            comment: "alice".into(),
            client_endpoint: "vpn.example.com:13231".into(),
            client_address: "10.9.0.2/32".into(),
            client_keepalive: 25,
            ..MikrotikPeerExtras::default()
        }));

        let p = Peer::from_physical(&pp, "wg0");
        assert_eq!(p.display_name, "laptop");
        assert_eq!(p.notes, "alice");
        assert_eq!(p.interface.peer_type, InterfaceType::Client);
        assert_eq!(p.interface.addresses, vec![net("10.9.0.2/32")]);
        assert_eq!(*p.persistent_keepalive.get(), 25);

        let mut back = pp.clone();
        p.merge_to_physical(&mut back);
        let extras = back.mikrotik_extras().expect("extras");
        assert_eq!(extras.id, "*3");
        assert!(extras.is_responder);
        assert_eq!(extras.client_address, "10.9.0.2/32");
    }

    #[test]
    fn local_disabled_extras_disable_peer() {
        let mut pp = PhysicalPeer::new(*KeyPair::generate().public_key());
        pp.import_source = BackendKind::Local;
        pp.extras = Some(PeerExtras::Local(LocalPeerExtras { disabled: true }));
        assert!(Peer::from_physical(&pp, "wg0").is_disabled());
    }

    #[test]
    fn editable_keys_gate_key_overwrite() {
        let mut stored = peer();
        let mut edit = peer();
        edit.display_name = "renamed".into();
        edit.persistent_keepalive = ConfigOption::new(30, false);

        let before = stored.identifier.clone();
        stored.overwrite_user_editable_fields(&edit, false);
        assert_eq!(stored.display_name, "renamed");
        assert_eq!(*stored.persistent_keepalive.get(), 30);
        assert_eq!(stored.identifier, before);

        stored.overwrite_user_editable_fields(&edit, true);
        assert_eq!(stored.identifier, edit.identifier);
    }
}
