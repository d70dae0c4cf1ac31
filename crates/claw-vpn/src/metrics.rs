//! Export of status snapshots.
//!
//! The collector hands every fresh interface and peer status to a
//! [`MetricsSink`]. [`PrometheusMetricsSink`] keeps them as gauges and
//! serves them on `/metrics`; [`TracingMetricsSink`] only logs them.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use parking_lot::RwLock;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::domain::{Interface, InterfaceStatus, Peer, PeerStatus, cidr};
use crate::error::{Result, VpnError};

/// Receives status snapshots after every collection pass.
///
/// Implementations handle their own failures; nothing is returned to the
/// collector.
pub trait MetricsSink: Send + Sync {
    /// Latest counters of an interface.
    fn update_interface_metrics(&self, interface: &Interface, status: &InterfaceStatus);

    /// Latest counters and liveness of a peer.
    fn update_peer_metrics(&self, peer: &Peer, status: &PeerStatus);
}

/// Sink that emits snapshots as `debug` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn update_interface_metrics(&self, interface: &Interface, status: &InterfaceStatus) {
        debug!(
            interface = %interface.identifier,
            rx = status.bytes_received,
            tx = status.bytes_transmitted,
            "interface metrics"
        );
    }

    fn update_peer_metrics(&self, peer: &Peer, status: &PeerStatus) {
        debug!(
            interface = %peer.interface_identifier,
            peer = %peer.identifier,
            rx = status.bytes_received,
            tx = status.bytes_transmitted,
            connected = status.is_connected,
            pingable = status.is_pingable,
            "peer metrics"
        );
    }
}

/// Labels of interface gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InterfaceLabels {
    /// Interface identifier.
    pub interface: String,
}

/// Labels of peer gauges.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PeerLabels {
    /// Interface the peer belongs to.
    pub interface: String,
    /// Comma separated tunnel addresses of the peer.
    pub addresses: String,
    /// Peer identifier (public key).
    pub id: String,
    /// Display name.
    pub name: String,
}

impl PeerLabels {
    fn of(peer: &Peer) -> Self {
        Self {
            interface: peer.interface_identifier.clone(),
            addresses: cidr::join_cidrs(&peer.interface.addresses),
            id: peer.identifier.clone(),
            name: peer.display_name.clone(),
        }
    }
}

/// Prometheus exporter for interface and peer statistics.
#[derive(Clone)]
pub struct PrometheusMetricsSink {
    registry: Arc<RwLock<Registry>>,
    iface_received_bytes: Family<InterfaceLabels, Gauge>,
    iface_sent_bytes: Family<InterfaceLabels, Gauge>,
    peer_up: Family<PeerLabels, Gauge>,
    peer_last_handshake: Family<PeerLabels, Gauge>,
    peer_received_bytes: Family<PeerLabels, Gauge>,
    peer_sent_bytes: Family<PeerLabels, Gauge>,
}

impl std::fmt::Debug for PrometheusMetricsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetricsSink").finish_non_exhaustive()
    }
}

impl Default for PrometheusMetricsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetricsSink {
    /// Content type of the text exposition format.
    pub const CONTENT_TYPE: &'static str = "text/plain; version=0.0.4; charset=utf-8";

    /// Creates the sink with all gauges registered.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let iface_received_bytes = Family::<InterfaceLabels, Gauge>::default();
        registry.register(
            "wireguard_interface_received_bytes_total",
            "Bytes received through the interface",
            iface_received_bytes.clone(),
        );
        let iface_sent_bytes = Family::<InterfaceLabels, Gauge>::default();
        registry.register(
            "wireguard_interface_sent_bytes_total",
            "Bytes sent through the interface",
            iface_sent_bytes.clone(),
        );

        let peer_up = Family::<PeerLabels, Gauge>::default();
        registry.register(
            "wireguard_peer_up",
            "Peer connection state (boolean: 1/0)",
            peer_up.clone(),
        );
        let peer_last_handshake = Family::<PeerLabels, Gauge>::default();
        registry.register(
            "wireguard_peer_last_handshake_seconds",
            "Unix time of the last handshake with the peer",
            peer_last_handshake.clone(),
        );
        let peer_received_bytes = Family::<PeerLabels, Gauge>::default();
        registry.register(
            "wireguard_peer_received_bytes_total",
            "Bytes received from the peer",
            peer_received_bytes.clone(),
        );
        let peer_sent_bytes = Family::<PeerLabels, Gauge>::default();
        registry.register(
            "wireguard_peer_sent_bytes_total",
            "Bytes sent to the peer",
            peer_sent_bytes.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            iface_received_bytes,
            iface_sent_bytes,
            peer_up,
            peer_last_handshake,
            peer_received_bytes,
            peer_sent_bytes,
        }
    }

    /// Renders all gauges in the Prometheus text format.
    #[must_use]
    pub fn encode(&self) -> String {
        let registry = self.registry.read();
        let mut buffer = String::new();
        if encode(&mut buffer, &registry).is_err() {
            error!("failed to encode prometheus metrics");
            return String::new();
        }
        buffer
    }

    /// Router exposing `GET /metrics`.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(Arc::clone(self))
    }

    /// Serves `/metrics` on `addr` until `token` is cancelled.
    pub async fn serve(self: Arc<Self>, addr: SocketAddr, token: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| VpnError::Metrics(format!("bind {addr}: {e}")))?;
        info!(addr = %addr, "metrics endpoint listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(token.cancelled_owned())
            .await
            .map_err(|e| VpnError::Metrics(e.to_string()))?;

        info!("metrics endpoint shut down");
        Ok(())
    }
}

async fn render_metrics(State(sink): State<Arc<PrometheusMetricsSink>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PrometheusMetricsSink::CONTENT_TYPE)],
        sink.encode(),
    )
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl MetricsSink for PrometheusMetricsSink {
    fn update_interface_metrics(&self, interface: &Interface, status: &InterfaceStatus) {
        let labels = InterfaceLabels {
            interface: interface.identifier.clone(),
        };
        self.iface_received_bytes
            .get_or_create(&labels)
            .set(gauge_value(status.bytes_received));
        self.iface_sent_bytes
            .get_or_create(&labels)
            .set(gauge_value(status.bytes_transmitted));
    }

    fn update_peer_metrics(&self, peer: &Peer, status: &PeerStatus) {
        let labels = PeerLabels::of(peer);
        if let Some(handshake) = status.last_handshake {
            self.peer_last_handshake
                .get_or_create(&labels)
                .set(handshake.timestamp());
        }
        self.peer_received_bytes
            .get_or_create(&labels)
            .set(gauge_value(status.bytes_received));
        self.peer_sent_bytes
            .get_or_create(&labels)
            .set(gauge_value(status.bytes_transmitted));
        self.peer_up
            .get_or_create(&labels)
            .set(i64::from(status.is_connected));
    }
}
