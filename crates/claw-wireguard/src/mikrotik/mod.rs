//! `RouterOS` controller speaking the device's REST API.

pub mod client;

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use ipnet::IpNet;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::controller::{Controller, UpdateFn};
use crate::error::{Result, WireGuardError};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::locks::ObjectLocks;
use crate::types::{
    BackendKind, DEFAULT_LISTEN_PORT, InterfaceExtras, MikrotikInterfaceExtras, MikrotikPeerExtras,
    PeerExtras, PhysicalInterface, PhysicalPeer, PingResult,
};

pub use client::{ClientSettings, JsonObject, MikrotikClient};
use client::{format_duration, get_bool, get_int, get_string, parse_duration};

const INTERFACE_PROPS: &[&str] = &[
    ".id",
    "name",
    "public-key",
    "private-key",
    "listen-port",
    "mtu",
    "disabled",
    "running",
    "comment",
];

const PEER_PROPS: &[&str] = &[
    ".id",
    "name",
    "allowed-address",
    "client-address",
    "client-endpoint",
    "client-keepalive",
    "comment",
    "current-endpoint-address",
    "current-endpoint-port",
    "last-handshake",
    "persistent-keepalive",
    "public-key",
    "private-key",
    "preshared-key",
    "mtu",
    "disabled",
    "rx",
    "tx",
    "responder",
    "client-dns",
];

const ADDRESS_PROPS: &[&str] = &[".id", "address", "network"];

/// Reported round trip when the device returns an unparsable value.
const UNKNOWN_RTT: Duration = Duration::from_millis(999_999);

/// Settings for one `RouterOS` backend.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MikrotikConfig {
    /// Backend id used in interface records.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// REST base URL, e.g. `https://192.168.88.1/rest`.
    pub api_url: String,
    /// API user.
    pub api_user: String,
    /// API password.
    pub api_password: String,
    /// Verify the device TLS certificate.
    pub api_verify_tls: bool,
    /// Per-request timeout in seconds.
    pub api_timeout_secs: u64,
    /// Parallel requests when loading interface details.
    pub concurrency: usize,
    /// Interfaces never reported.
    pub ignored_interfaces: Vec<String>,
    /// Log API traffic.
    pub debug: bool,
}

impl Default for MikrotikConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            api_url: String::new(),
            api_user: String::new(),
            api_password: String::new(),
            api_verify_tls: true,
            api_timeout_secs: 30,
            concurrency: 5,
            ignored_interfaces: Vec::new(),
            debug: false,
        }
    }
}

impl fmt::Debug for MikrotikConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MikrotikConfig")
            .field("id", &self.id)
            .field("display_name", &self.display_name)
            .field("api_url", &self.api_url)
            .field("api_user", &self.api_user)
            .field("api_password", &"[REDACTED]")
            .field("api_verify_tls", &self.api_verify_tls)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    const fn command(self) -> &'static str {
        match self {
            Self::V4 => "/ip/address",
            Self::V6 => "/ipv6/address",
        }
    }

    const fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::V4,
            IpNet::V6(_) => Self::V6,
        }
    }
}

struct DeviceAddress {
    id: String,
    family: AddressFamily,
    address: IpNet,
}

/// Controller for a `RouterOS` v7 device.
pub struct MikrotikController {
    id: String,
    client: MikrotikClient,
    concurrency: usize,
    ignored: HashSet<String>,
    locks: ObjectLocks,
}

impl MikrotikController {
    /// Builds a controller from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(config: &MikrotikConfig) -> Result<Self> {
        let client = MikrotikClient::new(ClientSettings {
            api_url: config.api_url.clone(),
            api_user: config.api_user.clone(),
            api_password: SecretString::from(config.api_password.clone()),
            verify_tls: config.api_verify_tls,
            timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
            debug: config.debug,
        })?;
        info!(backend = %config.id, url = %config.api_url, "routeros controller ready");
        Ok(Self {
            id: config.id.clone(),
            client,
            concurrency: config.concurrency.max(1),
            ignored: config.ignored_interfaces.iter().cloned().collect(),
            locks: ObjectLocks::new(),
        })
    }

    async fn load_interface(&self, wg: JsonObject) -> Result<PhysicalInterface> {
        let device_id = get_string(&wg, ".id");
        let name = get_string(&wg, "name");

        let counters = self
            .client
            .get(&format!("/interface/{device_id}"), &["name", "rx-byte", "tx-byte"])
            .await?;
        let addresses = self.load_addresses(&name).await?;

        let private_key = match get_string(&wg, "private-key") {
            s if s.is_empty() => None,
            s => Some(PrivateKey::from_base64(&s)?),
        };
        let public_key = match get_string(&wg, "public-key") {
            s if s.is_empty() => private_key.as_ref().map(PrivateKey::public_key),
            s => Some(PublicKey::from_base64(&s)?),
        };

        Ok(PhysicalInterface {
            identifier: name,
            private_key,
            public_key,
            listen_port: u16::try_from(get_int(&wg, "listen-port")).unwrap_or_default(),
            addresses: addresses.into_iter().map(|a| a.address).collect(),
            mtu: u32::try_from(get_int(&wg, "mtu")).unwrap_or_default(),
            firewall_mark: 0,
            device_up: get_bool(&wg, "running"),
            import_source: BackendKind::Mikrotik,
            device_type: BackendKind::Mikrotik.to_string(),
            bytes_upload: u64::try_from(get_int(&counters, "tx-byte")).unwrap_or_default(),
            bytes_download: u64::try_from(get_int(&counters, "rx-byte")).unwrap_or_default(),
            extras: Some(InterfaceExtras::Mikrotik(MikrotikInterfaceExtras {
                id: device_id,
                comment: get_string(&wg, "comment"),
                disabled: get_bool(&wg, "disabled"),
            })),
        })
    }

    async fn load_addresses(&self, interface: &str) -> Result<Vec<DeviceAddress>> {
        let mut out = Vec::new();
        for family in [AddressFamily::V4, AddressFamily::V6] {
            let items = self
                .client
                .query(
                    family.command(),
                    &[("interface", interface), ("dynamic", "false"), ("disabled", "false")],
                    ADDRESS_PROPS,
                )
                .await?;
            for item in items {
                let raw = get_string(&item, "address");
                match raw.parse::<IpNet>() {
                    Ok(address) => out.push(DeviceAddress {
                        id: get_string(&item, ".id"),
                        family,
                        address,
                    }),
                    Err(e) => warn!(interface, address = %raw, error = %e, "skipping address"),
                }
            }
        }
        Ok(out)
    }

    async fn sync_addresses(&self, interface: &str, desired: &[IpNet]) -> Result<()> {
        let current = self.load_addresses(interface).await?;
        for addr in current.iter().filter(|a| !desired.contains(&a.address)) {
            debug!(interface, address = %addr.address, "removing address");
            self.client
                .delete(&format!("{}/{}", addr.family.command(), addr.id))
                .await?;
        }
        for net in desired
            .iter()
            .filter(|n| !current.iter().any(|a| a.address == **n))
        {
            debug!(interface, address = %net, "adding address");
            self.client
                .create(
                    AddressFamily::of(net).command(),
                    &json!({ "address": net.to_string(), "interface": interface }),
                )
                .await?;
        }
        Ok(())
    }

    async fn find_peer(&self, interface: &str, peer: &PublicKey) -> Result<Option<JsonObject>> {
        let key = peer.to_base64();
        let mut items = self
            .client
            .query(
                "/interface/wireguard/peers",
                &[("interface", interface), ("public-key", key.as_str())],
                PEER_PROPS,
            )
            .await?;
        Ok(if items.is_empty() { None } else { Some(items.swap_remove(0)) })
    }

    fn convert_peer(obj: &JsonObject) -> Result<PhysicalPeer> {
        let public_key = PublicKey::from_base64(&get_string(obj, "public-key"))?;
        let mut peer = PhysicalPeer::new(public_key);

        let host = get_string(obj, "current-endpoint-address");
        let port = get_string(obj, "current-endpoint-port");
        if !host.is_empty() && !port.is_empty() && port != "0" {
            peer.endpoint = join_endpoint(&host, &port);
        }

        peer.allowed_ips = parse_address_list(&get_string(obj, "allowed-address"))?;
        peer.persistent_keepalive = duration_secs(&get_string(obj, "persistent-keepalive"));
        peer.last_handshake = parse_duration(&get_string(obj, "last-handshake"))
            .and_then(|ago| chrono::Duration::from_std(ago).ok())
            .map(|ago| Utc::now() - ago);

        peer.private_key = match get_string(obj, "private-key") {
            s if s.is_empty() => None,
            s => Some(PrivateKey::from_base64(&s)?),
        };
        peer.preshared_key = match get_string(obj, "preshared-key") {
            s if s.is_empty() => None,
            s => Some(PresharedKey::from_base64(&s)?),
        };

        peer.protocol_version = 0;
        peer.bytes_upload = u64::try_from(get_int(obj, "rx")).unwrap_or_default();
        peer.bytes_download = u64::try_from(get_int(obj, "tx")).unwrap_or_default();
        peer.import_source = BackendKind::Mikrotik;
        peer.extras = Some(PeerExtras::Mikrotik(MikrotikPeerExtras {
            id: get_string(obj, ".id"),
            name: get_string(obj, "name"),
            comment: get_string(obj, "comment"),
            is_responder: get_bool(obj, "responder"),
            disabled: get_bool(obj, "disabled"),
            client_endpoint: get_string(obj, "client-endpoint"),
            client_address: get_string(obj, "client-address"),
            client_dns: get_string(obj, "client-dns"),
            client_keepalive: duration_secs(&get_string(obj, "client-keepalive")),
        }));
        Ok(peer)
    }

    fn peer_patch(peer: &PhysicalPeer, extras: &MikrotikPeerExtras) -> Value {
        let (endpoint_address, endpoint_port) = if extras.is_responder {
            (String::new(), "0".to_string())
        } else {
            split_endpoint(&peer.endpoint)
        };
        let allowed: Vec<String> = peer.allowed_ips.iter().map(ToString::to_string).collect();

        let mut body = json!({
            "name": extras.name,
            "comment": extras.comment,
            "preshared-key": peer.preshared_key.as_ref().map(PresharedKey::to_base64).unwrap_or_default(),
            "public-key": peer.public_key.to_base64(),
            "persistent-keepalive": format_duration(u64::from(peer.persistent_keepalive)),
            "disabled": extras.disabled.to_string(),
            "responder": extras.is_responder.to_string(),
            "client-endpoint": extras.client_endpoint,
            "client-address": extras.client_address,
            "client-keepalive": format_duration(u64::from(extras.client_keepalive)),
            "client-dns": extras.client_dns,
            "endpoint-address": endpoint_address,
            "endpoint-port": endpoint_port,
            "allowed-address": allowed.join(","),
        });
        if let Some(key) = &peer.private_key {
            body["private-key"] = Value::String(key.to_base64());
        }
        body
    }
}

fn join_endpoint(host: &str, port: &str) -> String {
    match (host.parse::<IpAddr>(), port.parse::<u16>()) {
        (Ok(ip), Ok(port)) => SocketAddr::new(ip, port).to_string(),
        _ => format!("{host}:{port}"),
    }
}

/// Splits `host:port`; the port defaults to the `WireGuard` default.
fn split_endpoint(endpoint: &str) -> (String, String) {
    if endpoint.is_empty() {
        return (String::new(), DEFAULT_LISTEN_PORT.to_string());
    }
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port().to_string());
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            (host.to_string(), port.to_string())
        }
        _ => (
            endpoint.trim_matches(['[', ']']).to_string(),
            DEFAULT_LISTEN_PORT.to_string(),
        ),
    }
}

fn parse_address_list(raw: &str) -> Result<Vec<IpNet>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<IpNet>() {
            Ok(net) => Ok(net),
            Err(e) => s.parse::<IpAddr>().map(IpNet::from).map_err(|_| e.into()),
        })
        .collect()
}

fn duration_secs(raw: &str) -> u16 {
    parse_duration(raw)
        .map(|d| u16::try_from(d.as_secs()).unwrap_or(u16::MAX))
        .unwrap_or_default()
}

#[async_trait]
impl Controller for MikrotikController {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Mikrotik
    }

    async fn interfaces(&self) -> Result<Vec<PhysicalInterface>> {
        let wgs: Vec<JsonObject> = self
            .client
            .query("/interface/wireguard", &[], INTERFACE_PROPS)
            .await?
            .into_iter()
            .filter(|wg| !self.ignored.contains(&get_string(wg, "name")))
            .collect();

        stream::iter(wgs)
            .map(|wg| self.load_interface(wg))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    async fn interface(&self, id: &str) -> Result<PhysicalInterface> {
        let mut items = self
            .client
            .query("/interface/wireguard", &[("name", id)], INTERFACE_PROPS)
            .await?;
        if items.is_empty() {
            return Err(WireGuardError::InterfaceNotFound(id.to_string()));
        }
        self.load_interface(items.swap_remove(0)).await
    }

    async fn peers(&self, interface: &str) -> Result<Vec<PhysicalPeer>> {
        self.client
            .query("/interface/wireguard/peers", &[("interface", interface)], PEER_PROPS)
            .await?
            .iter()
            .map(Self::convert_peer)
            .collect()
    }

    async fn peer(&self, interface: &str, peer: &PublicKey) -> Result<PhysicalPeer> {
        match self.find_peer(interface, peer).await? {
            Some(obj) => Self::convert_peer(&obj),
            None => Err(WireGuardError::PeerNotFound {
                interface: interface.to_string(),
                peer: peer.to_base64(),
            }),
        }
    }

    async fn save_interface(&self, id: &str, update: UpdateFn<'_, PhysicalInterface>) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let mut iface = match self.interface(id).await {
            Ok(iface) => iface,
            Err(e) if e.is_not_exist() => {
                info!(interface = id, "creating routeros interface");
                self.client
                    .create("/interface/wireguard", &json!({ "name": id }))
                    .await?;
                self.interface(id).await?
            }
            Err(e) => return Err(e),
        };
        let device_id = iface.mikrotik_extras().map(|e| e.id.clone()).unwrap_or_default();

        update(&mut iface)?;

        let mut extras = iface.mikrotik_extras().cloned().unwrap_or_default();
        extras.id = device_id;

        let mut body = json!({
            "name": iface.identifier,
            "comment": extras.comment,
            "mtu": iface.mtu.to_string(),
            "listen-port": iface.listen_port.to_string(),
            "disabled": (!iface.device_up).to_string(),
        });
        if let Some(key) = &iface.private_key {
            body["private-key"] = Value::String(key.to_base64());
        }
        self.client
            .update(&format!("/interface/wireguard/{}", extras.id), &body)
            .await?;

        self.sync_addresses(&iface.identifier, &iface.addresses).await
    }

    async fn delete_interface(&self, id: &str) -> Result<()> {
        let guard = self.locks.lock(id).await;

        for addr in self.load_addresses(id).await? {
            self.client
                .delete(&format!("{}/{}", addr.family.command(), addr.id))
                .await?;
        }

        let items = self
            .client
            .query("/interface/wireguard", &[("name", id)], &[".id"])
            .await?;
        let Some(obj) = items.first() else {
            return Ok(());
        };
        self.client
            .delete(&format!("/interface/wireguard/{}", get_string(obj, ".id")))
            .await?;
        drop(guard);
        self.locks.forget(id);
        info!(interface = id, "routeros interface deleted");
        Ok(())
    }

    async fn save_peer(
        &self,
        interface: &str,
        peer: &PublicKey,
        update: UpdateFn<'_, PhysicalPeer>,
    ) -> Result<()> {
        let key = ObjectLocks::peer_key(interface, &peer.to_base64());
        let _guard = self.locks.lock(&key).await;

        let obj = match self.find_peer(interface, peer).await? {
            Some(obj) => obj,
            None => {
                debug!(interface, peer = %peer.short(), "creating routeros peer");
                self.client
                    .create(
                        "/interface/wireguard/peers",
                        &json!({
                            "name": format!("tmp-wg-{}", peer.short()),
                            "interface": interface,
                            "public-key": peer.to_base64(),
                            "allowed-address": "0.0.0.0/0",
                        }),
                    )
                    .await?;
                self.find_peer(interface, peer).await?.ok_or_else(|| {
                    WireGuardError::PeerNotFound {
                        interface: interface.to_string(),
                        peer: peer.to_base64(),
                    }
                })?
            }
        };

        let mut physical = Self::convert_peer(&obj)?;
        let current = physical.mikrotik_extras().cloned().unwrap_or_default();

        update(&mut physical)?;

        let mut extras = physical.mikrotik_extras().cloned().unwrap_or_default();
        extras.id.clone_from(&current.id);
        if extras.name.is_empty() {
            extras.name = current.name;
        }

        self.client
            .update(
                &format!("/interface/wireguard/peers/{}", extras.id),
                &Self::peer_patch(&physical, &extras),
            )
            .await
    }

    async fn delete_peer(&self, interface: &str, peer: &PublicKey) -> Result<()> {
        let encoded = peer.to_base64();
        let key = ObjectLocks::peer_key(interface, &encoded);
        let guard = self.locks.lock(&key).await;

        let items = self
            .client
            .query(
                "/interface/wireguard/peers",
                &[("interface", interface), ("public-key", encoded.as_str())],
                &[".id"],
            )
            .await?;
        if let Some(obj) = items.first() {
            self.client
                .delete(&format!("/interface/wireguard/peers/{}", get_string(obj, ".id")))
                .await?;
        }
        drop(guard);
        self.locks.forget(&key);
        Ok(())
    }

    async fn ping(&self, address: &str) -> Result<PingResult> {
        let items = self
            .client
            .exec_list(
                "/tool/ping",
                &json!({ "address": address, "count": 1, "interval": "00:00:02" }),
            )
            .await?;

        let mut result = PingResult::default();
        for item in &items {
            let sent = u32::try_from(get_int(item, "sent")).unwrap_or_default();
            let received = u32::try_from(get_int(item, "received")).unwrap_or_default();
            result.packets_sent += sent;
            result.packets_recv += received;
            if received > 0 {
                result
                    .rtts
                    .push(parse_duration(&get_string(item, "avg-rtt")).unwrap_or(UNKNOWN_RTT));
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::controller::update_fn;
    use crate::keys::KeyPair;
    use test_case::test_case;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, MikrotikController) {
        let server = MockServer::start().await;
        let controller = MikrotikController::new(&MikrotikConfig {
            id: "router".into(),
            api_url: format!("{}/rest", server.uri()),
            api_user: "admin".into(),
            api_password: "pw".into(),
            ..MikrotikConfig::default()
        })
        .unwrap();
        (server, controller)
    }

    async fn mount_addresses(server: &MockServer, name: &str, v4: Value, v6: Value) {
        Mock::given(method("GET"))
            .and(path("/rest/ip/address"))
            .and(query_param("interface", name))
            .respond_with(ResponseTemplate::new(200).set_body_json(v4))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/ipv6/address"))
            .and(query_param("interface", name))
            .respond_with(ResponseTemplate::new(200).set_body_json(v6))
            .mount(server)
            .await;
    }

    async fn mount_counters(server: &MockServer, device_id: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/rest/interface/{device_id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "wg0", "rx-byte": "100", "tx-byte": "200"
            })))
            .mount(server)
            .await;
    }

    fn wg_object(pair: &KeyPair) -> Value {
        json!({
            ".id": "*1",
            "name": "wg0",
            "public-key": pair.public_key().to_base64(),
            "private-key": pair.private_key().to_base64(),
            "listen-port": "13231",
            "mtu": "1420",
            "disabled": "false",
            "running": "true",
            "comment": "office"
        })
    }

    #[test_case("", ("", "51820"); "empty")]
    #[test_case("1.2.3.4:5000", ("1.2.3.4", "5000"); "ipv4")]
    #[test_case("[fd00::1]:5000", ("fd00::1", "5000"); "ipv6")]
    #[test_case("vpn.example.com", ("vpn.example.com", "51820"); "host without port")]
    #[test_case("vpn.example.com:443", ("vpn.example.com", "443"); "host with port")]
    fn splits_endpoints(input: &str, expected: (&str, &str)) {
        let (host, port) = split_endpoint(input);
        assert_eq!((host.as_str(), port.as_str()), expected);
    }

    #[test]
    fn address_list_accepts_bare_ips() {
        let nets = parse_address_list("10.0.0.0/24, 10.1.1.1,fd00::/64").unwrap();
        assert_eq!(
            nets,
            vec![
                "10.0.0.0/24".parse::<IpNet>().unwrap(),
                "10.1.1.1/32".parse().unwrap(),
                "fd00::/64".parse().unwrap(),
            ]
        );
        assert!(parse_address_list("").unwrap().is_empty());
        assert!(parse_address_list("nope").is_err());
    }

    #[tokio::test]
    async fn lists_interfaces_with_addresses_and_counters() {
        let (server, ctrl) = setup().await;
        let pair = KeyPair::generate();
        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([wg_object(&pair)])))
            .mount(&server)
            .await;
        mount_counters(&server, "*1").await;
        mount_addresses(
            &server,
            "wg0",
            json!([{ ".id": "*A", "address": "10.6.6.1/24", "network": "10.6.6.0" }]),
            json!([{ ".id": "*B", "address": "fd00::1/64", "network": "fd00::" }]),
        )
        .await;

        let ifaces = ctrl.interfaces().await.unwrap();
        assert_eq!(ifaces.len(), 1);
        let wg0 = &ifaces[0];
        assert_eq!(wg0.identifier, "wg0");
        assert_eq!(wg0.listen_port, 13231);
        assert_eq!(wg0.mtu, 1420);
        assert!(wg0.device_up);
        assert_eq!(wg0.bytes_upload, 200);
        assert_eq!(wg0.bytes_download, 100);
        assert_eq!(wg0.key_pair(), Some(pair));
        assert_eq!(wg0.addresses.len(), 2);
        let extras = wg0.mikrotik_extras().unwrap();
        assert_eq!(extras.id, "*1");
        assert_eq!(extras.comment, "office");
    }

    #[tokio::test]
    async fn missing_interface_is_not_exist() {
        let (server, ctrl) = setup().await;
        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard"))
            .and(query_param("name", "wg9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        assert!(ctrl.interface("wg9").await.unwrap_err().is_not_exist());
    }

    #[tokio::test]
    async fn save_interface_creates_then_patches_and_syncs_addresses() {
        let (server, ctrl) = setup().await;
        let pair = KeyPair::generate();

        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard"))
            .and(query_param("name", "wg0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard"))
            .and(query_param("name", "wg0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([wg_object(&pair)])))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/rest/interface/wireguard"))
            .and(body_partial_json(json!({ "name": "wg0" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ ".id": "*1" })))
            .expect(1)
            .mount(&server)
            .await;
        mount_counters(&server, "*1").await;
        mount_addresses(
            &server,
            "wg0",
            json!([{ ".id": "*A", "address": "10.6.6.1/24" }]),
            json!([]),
        )
        .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/interface/wireguard/*1"))
            .and(body_partial_json(json!({
                "listen-port": "51000", "mtu": "1380", "disabled": "false", "comment": "office"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/ip/address/*A"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/rest/ip/address"))
            .and(body_partial_json(json!({ "address": "10.7.7.1/24", "interface": "wg0" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ ".id": "*C" })))
            .expect(1)
            .mount(&server)
            .await;

        ctrl.save_interface(
            "wg0",
            update_fn(|pi: &mut PhysicalInterface| {
                pi.listen_port = 51000;
                pi.mtu = 1380;
                pi.device_up = true;
                pi.addresses = vec!["10.7.7.1/24".parse().unwrap()];
                // the engine never knows the device id
                pi.extras = Some(InterfaceExtras::Mikrotik(MikrotikInterfaceExtras {
                    comment: "office".into(),
                    ..MikrotikInterfaceExtras::default()
                }));
                Ok(())
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn peers_are_mapped() {
        let (server, ctrl) = setup().await;
        let key = *KeyPair::generate().public_key();
        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard/peers"))
            .and(query_param("interface", "wg0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                ".id": "*5",
                "name": "laptop",
                "public-key": key.to_base64(),
                "allowed-address": "10.6.6.2/32,fd00::2/128",
                "current-endpoint-address": "203.0.113.9",
                "current-endpoint-port": "40000",
                "persistent-keepalive": "25s",
                "last-handshake": "1m30s",
                "rx": "1000",
                "tx": "2000",
                "responder": "true",
                "disabled": "false",
                "client-keepalive": "15s",
                "client-dns": "1.1.1.1"
            }])))
            .mount(&server)
            .await;

        let peers = ctrl.peers("wg0").await.unwrap();
        assert_eq!(peers.len(), 1);
        let p = &peers[0];
        assert_eq!(p.public_key, key);
        assert_eq!(p.endpoint, "203.0.113.9:40000");
        assert_eq!(p.allowed_ips.len(), 2);
        assert_eq!(p.persistent_keepalive, 25);
        assert_eq!(p.bytes_upload, 1000);
        assert_eq!(p.bytes_download, 2000);
        assert_eq!(p.protocol_version, 0);
        let ago = Utc::now() - p.last_handshake.unwrap();
        assert!((89..=95).contains(&ago.num_seconds()));
        let extras = p.mikrotik_extras().unwrap();
        assert!(extras.is_responder);
        assert_eq!(extras.name, "laptop");
        assert_eq!(extras.client_keepalive, 15);
    }

    #[tokio::test]
    async fn save_peer_creates_placeholder_then_patches() {
        let (server, ctrl) = setup().await;
        let key = *KeyPair::generate().public_key();
        let found = json!([{
            ".id": "*7",
            "name": format!("tmp-wg-{}", key.short()),
            "public-key": key.to_base64(),
            "allowed-address": "0.0.0.0/0"
        }]);

        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard/peers"))
            .and(query_param("public-key", key.to_base64()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard/peers"))
            .and(query_param("public-key", key.to_base64()))
            .respond_with(ResponseTemplate::new(200).set_body_json(found))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/rest/interface/wireguard/peers"))
            .and(body_partial_json(json!({
                "name": format!("tmp-wg-{}", key.short()),
                "interface": "wg0",
                "allowed-address": "0.0.0.0/0"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ ".id": "*7" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/rest/interface/wireguard/peers/*7"))
            .and(body_partial_json(json!({
                "name": format!("tmp-wg-{}", key.short()),
                "endpoint-address": "198.51.100.4",
                "endpoint-port": "51820",
                "persistent-keepalive": "25s",
                "allowed-address": "10.6.6.2/32",
                "responder": "false"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        ctrl.save_peer(
            "wg0",
            &key,
            update_fn(|pp: &mut PhysicalPeer| {
                pp.endpoint = "198.51.100.4".into();
                pp.persistent_keepalive = 25;
                pp.allowed_ips = vec!["10.6.6.2/32".parse().unwrap()];
                Ok(())
            }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn delete_missing_peer_is_ok() {
        let (server, ctrl) = setup().await;
        Mock::given(method("GET"))
            .and(path("/rest/interface/wireguard/peers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let key = *KeyPair::generate().public_key();
        ctrl.delete_peer("wg0", &key).await.unwrap();
    }

    #[tokio::test]
    async fn ping_sums_replies() {
        let (server, ctrl) = setup().await;
        Mock::given(method("POST"))
            .and(path("/rest/tool/ping"))
            .and(body_partial_json(json!({ "address": "10.6.6.2", "count": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "sent": "1", "received": "1", "avg-rtt": "1ms500us"
            }])))
            .mount(&server)
            .await;

        let result = ctrl.ping("10.6.6.2").await.unwrap();
        assert!(result.is_pingable());
        assert_eq!(result.rtts.len(), 1);
        assert!((1499..=1500).contains(&result.rtts[0].as_micros()));
    }
}
