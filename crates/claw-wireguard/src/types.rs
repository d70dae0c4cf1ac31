//! Physical device model shared by every backend.
//!
//! These records mirror what a controller can read from or write to a device.
//! They are rebuilt on every call and never persisted.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::keys::{KeyPair, PresharedKey, PrivateKey, PublicKey};

/// Default `WireGuard` listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Default interface MTU.
pub const DEFAULT_MTU: u32 = 1420;

/// Backend family a controller belongs to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kernel `WireGuard` driven through netlink.
    #[default]
    Local,
    /// `RouterOS` REST API.
    Mikrotik,
    /// In-process fake.
    Memory,
}

impl BackendKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Mikrotik => "mikrotik",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra state only a `RouterOS` device keeps for an interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MikrotikInterfaceExtras {
    /// Internal `.id` of the device object.
    pub id: String,
    /// Free-form comment, mirrored to the display name.
    pub comment: String,
    /// Administrative disabled flag.
    pub disabled: bool,
}

/// Backend specific interface extras.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InterfaceExtras {
    /// `RouterOS` extras.
    Mikrotik(MikrotikInterfaceExtras),
}

/// Extra state only a `RouterOS` device keeps for a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MikrotikPeerExtras {
    /// Internal `.id` of the device object.
    pub id: String,
    /// Peer name on the device.
    pub name: String,
    /// Free-form comment.
    pub comment: String,
    /// The device waits for this peer to connect.
    pub is_responder: bool,
    /// Administrative disabled flag.
    pub disabled: bool,
    /// Endpoint handed to the client side.
    pub client_endpoint: String,
    /// Address handed to the client side.
    pub client_address: String,
    /// DNS handed to the client side.
    pub client_dns: String,
    /// Keepalive handed to the client side, in seconds.
    pub client_keepalive: u16,
}

/// Extras for kernel peers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPeerExtras {
    /// The peer is disabled in the database.
    pub disabled: bool,
}

/// Backend specific peer extras.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PeerExtras {
    /// Kernel extras.
    Local(LocalPeerExtras),
    /// `RouterOS` extras.
    Mikrotik(MikrotikPeerExtras),
}

/// Live state of a `WireGuard` interface as reported by a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalInterface {
    /// Device name, for example `wg0`.
    pub identifier: String,
    /// Private key, when the backend exposes it.
    pub private_key: Option<PrivateKey>,
    /// Public key.
    pub public_key: Option<PublicKey>,
    /// UDP listen port.
    pub listen_port: u16,
    /// Interface addresses, host bits included.
    pub addresses: Vec<IpNet>,
    /// Device MTU.
    pub mtu: u32,
    /// Firewall mark; zero when unset.
    pub firewall_mark: u32,
    /// Link state.
    pub device_up: bool,
    /// Backend that reported this interface.
    pub import_source: BackendKind,
    /// Device flavour, e.g. `kernel` or `routeros`.
    pub device_type: String,
    /// Bytes sent by the device.
    pub bytes_upload: u64,
    /// Bytes received by the device.
    pub bytes_download: u64,
    /// Backend specific state.
    pub extras: Option<InterfaceExtras>,
}

impl PhysicalInterface {
    /// An empty interface record with the given name.
    #[must_use]
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            private_key: None,
            public_key: None,
            listen_port: 0,
            addresses: Vec::new(),
            mtu: DEFAULT_MTU,
            firewall_mark: 0,
            device_up: false,
            import_source: BackendKind::default(),
            device_type: String::new(),
            bytes_upload: 0,
            bytes_download: 0,
            extras: None,
        }
    }

    /// Key pair, if both halves are known and consistent.
    #[must_use]
    pub fn key_pair(&self) -> Option<KeyPair> {
        let private = self.private_key.clone()?;
        match self.public_key {
            Some(public) => KeyPair::from_parts(private, public).ok(),
            None => Some(KeyPair::from_private_key(private)),
        }
    }

    /// Sets both key halves.
    pub fn set_key_pair(&mut self, pair: &KeyPair) {
        self.private_key = Some(pair.private_key().clone());
        self.public_key = Some(*pair.public_key());
    }

    /// `RouterOS` extras, if present.
    #[must_use]
    pub fn mikrotik_extras(&self) -> Option<&MikrotikInterfaceExtras> {
        match &self.extras {
            Some(InterfaceExtras::Mikrotik(e)) => Some(e),
            None => None,
        }
    }
}

impl Default for PhysicalInterface {
    fn default() -> Self {
        Self::new("")
    }
}

/// Live state of a `WireGuard` peer as reported by a backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPeer {
    /// Peer public key; also its identifier.
    pub public_key: PublicKey,
    /// Endpoint as `host:port`, empty when unknown.
    pub endpoint: String,
    /// Allowed IP networks.
    pub allowed_ips: Vec<IpNet>,
    /// Private key; unknown for imported peers.
    pub private_key: Option<PrivateKey>,
    /// Optional preshared key.
    pub preshared_key: Option<PresharedKey>,
    /// Keepalive interval in seconds; zero disables it.
    pub persistent_keepalive: u16,
    /// Last completed handshake.
    pub last_handshake: Option<DateTime<Utc>>,
    /// `WireGuard` protocol version.
    pub protocol_version: u32,
    /// Bytes the remote peer sent to the device.
    pub bytes_upload: u64,
    /// Bytes the remote peer received from the device.
    pub bytes_download: u64,
    /// Backend that reported this peer.
    pub import_source: BackendKind,
    /// Backend specific state.
    pub extras: Option<PeerExtras>,
}

impl PhysicalPeer {
    /// An empty peer record for the given key.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            endpoint: String::new(),
            allowed_ips: Vec::new(),
            private_key: None,
            preshared_key: None,
            persistent_keepalive: 0,
            last_handshake: None,
            protocol_version: 1,
            bytes_upload: 0,
            bytes_download: 0,
            import_source: BackendKind::default(),
            extras: None,
        }
    }

    /// Identifier string (base64 public key).
    #[must_use]
    pub fn identifier(&self) -> String {
        self.public_key.to_base64()
    }

    /// `RouterOS` extras, if present.
    #[must_use]
    pub fn mikrotik_extras(&self) -> Option<&MikrotikPeerExtras> {
        match &self.extras {
            Some(PeerExtras::Mikrotik(e)) => Some(e),
            _ => None,
        }
    }

    /// Kernel extras, if present.
    #[must_use]
    pub fn local_extras(&self) -> Option<&LocalPeerExtras> {
        match &self.extras {
            Some(PeerExtras::Local(e)) => Some(e),
            _ => None,
        }
    }
}

/// Outcome of an ICMP liveness probe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    /// Echo requests sent.
    pub packets_sent: u32,
    /// Echo replies received.
    pub packets_recv: u32,
    /// Round trip times of the replies.
    pub rtts: Vec<Duration>,
}

impl PingResult {
    /// A probe with a single echo counts as pingable when it was answered.
    #[must_use]
    pub fn is_pingable(&self) -> bool {
        self.packets_recv == 1
    }

    /// Average round trip time.
    #[must_use]
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.rtts.is_empty() {
            return None;
        }
        let total: Duration = self.rtts.iter().sum();
        Some(total / self.rtts.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_key_pair_requires_private_half() {
        let mut iface = PhysicalInterface::new("wg0");
        assert!(iface.key_pair().is_none());

        let pair = KeyPair::generate();
        iface.set_key_pair(&pair);
        assert_eq!(iface.key_pair(), Some(pair));
    }

    #[test]
    fn interface_key_pair_rejects_mismatch() {
        let mut iface = PhysicalInterface::new("wg0");
        iface.private_key = Some(PrivateKey::generate());
        iface.public_key = Some(*KeyPair::generate().public_key());
        assert!(iface.key_pair().is_none());
    }

    #[test]
    fn peer_identifier_is_base64_key() {
        let key = *KeyPair::generate().public_key();
        let peer = PhysicalPeer::new(key);
        assert_eq!(peer.identifier(), key.to_base64());
    }

    #[test]
    fn peer_extras_accessors() {
        let mut peer = PhysicalPeer::new(*KeyPair::generate().public_key());
        peer.extras = Some(PeerExtras::Local(LocalPeerExtras { disabled: true }));
        assert!(peer.local_extras().is_some_and(|e| e.disabled));
        assert!(peer.mikrotik_extras().is_none());
    }

    #[test]
    fn ping_result_pingable() {
        let ok = PingResult {
            packets_sent: 1,
            packets_recv: 1,
            rtts: vec![Duration::from_millis(10), Duration::from_millis(30)],
        };
        assert!(ok.is_pingable());
        assert_eq!(ok.average_rtt(), Some(Duration::from_millis(20)));
        assert!(!PingResult::default().is_pingable());
        assert_eq!(PingResult::default().average_rtt(), None);
    }

    #[test]
    fn backend_kind_serde_lowercase() {
        let json = serde_json::to_string(&BackendKind::Mikrotik).expect("serialize");
        assert_eq!(json, "\"mikrotik\"");
        assert_eq!(BackendKind::Local.to_string(), "local");
    }
}
