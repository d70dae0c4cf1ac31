//! Periodic collection of interface and peer statistics.
//!
//! Three loops, each switched on separately in `[statistics]`:
//! interface byte counters, peer counters and handshakes, and a pool of
//! ping workers fed from a bounded queue. Results land in the statistics
//! repository and are handed to the metrics sink.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use claw_wireguard::ping::PING_TIMEOUT;
use claw_wireguard::{ControllerRegistry, PhysicalInterface, PhysicalPeer, PublicKey};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::VpnConfig;
use crate::domain::{InterfaceStatus, Peer, PeerStatus, is_recent};
use crate::error::{Result, VpnError};
use crate::metrics::MetricsSink;
use crate::repository::{
    InterfaceAndPeerRepository, Repositories, StatisticsRepository, repo_update,
};

/// Start of the session a peer is in, given its previous status row and
/// freshly observed counters.
///
/// `received` counts bytes sent by the peer, `transmitted` bytes sent to it.
/// Without a handshake there is no session. A new session starts when
/// traffic flows for the first time, when one direction starts flowing after
/// a stale handshake, or when a counter went backwards. Otherwise the
/// previous start is kept.
pub fn session_start(
    old: &PeerStatus,
    received: u64,
    transmitted: u64,
    handshake: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let handshake = handshake?;
    let stale = |at: Option<DateTime<Utc>>| at.is_none_or(|hs| !is_recent(hs, now));

    let never_flowed =
        old.bytes_received == 0 && old.bytes_transmitted == 0 && (received > 0 || transmitted > 0);
    let first_receive = old.bytes_received == 0 && received > 0 && stale(old.last_handshake);
    let first_transmit = old.bytes_transmitted == 0
        && transmitted > 0
        && (old.last_session_start.is_none() || stale(old.last_handshake));
    let counters_reset = (received != 0 && received < old.bytes_received)
        || (transmitted != 0 && transmitted < old.bytes_transmitted);

    if never_flowed || first_receive || first_transmit || counters_reset {
        Some(handshake)
    } else {
        old.last_session_start
    }
}

/// Runs the statistics loops.
pub struct StatisticsCollector {
    cfg: Arc<VpnConfig>,
    registry: Arc<ControllerRegistry>,
    db: Arc<dyn InterfaceAndPeerRepository>,
    stats: Arc<dyn StatisticsRepository>,
    sink: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for StatisticsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatisticsCollector")
            .field("statistics", &self.cfg.statistics)
            .finish_non_exhaustive()
    }
}

impl StatisticsCollector {
    /// Creates a collector.
    pub fn new(
        cfg: Arc<VpnConfig>,
        registry: Arc<ControllerRegistry>,
        repos: &Repositories,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            cfg,
            registry,
            db: Arc::clone(&repos.interfaces),
            stats: Arc::clone(&repos.statistics),
            sink,
        }
    }

    /// Spawns the enabled loops. All of them stop when `token` is cancelled.
    pub fn start(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let settings = &self.cfg.statistics;
        let mut handles = Vec::new();

        if settings.collect_interface_data {
            let this = Arc::clone(self);
            handles.push(spawn_ticker(
                token.clone(),
                settings.collection_interval(),
                "interface data",
                move || {
                    let this = Arc::clone(&this);
                    async move { this.collect_interface_data().await }
                },
            ));
        }

        if settings.collect_peer_data {
            let this = Arc::clone(self);
            handles.push(spawn_ticker(
                token.clone(),
                settings.collection_interval(),
                "peer data",
                move || {
                    let this = Arc::clone(&this);
                    async move { this.collect_peer_data().await }
                },
            ));
        }

        if settings.use_ping_checks {
            handles.extend(self.start_ping_workers(token));
        }

        info!(loops = handles.len(), "statistics collector started");
        handles
    }

    /// One pass over the interface counters.
    ///
    /// # Errors
    ///
    /// Fails only when the interface list cannot be loaded.
    pub async fn collect_interface_data(&self) -> Result<()> {
        for iface in self.db.interfaces().await? {
            let id = iface.identifier.clone();
            let physical = match self.physical_interface(&iface.backend, &id).await {
                Ok(pi) => pi,
                Err(e) => {
                    debug!(interface = %id, error = %e, "no device data for interface");
                    continue;
                }
            };

            let now = Utc::now();
            let mut snapshot = None;
            let outcome = self
                .stats
                .update_interface_status(
                    &id,
                    repo_update(|current: Option<InterfaceStatus>| {
                        let mut status = current.unwrap_or_else(|| InterfaceStatus::new(id.as_str()));
                        status.updated_at = now;
                        status.bytes_received = physical.bytes_download;
                        status.bytes_transmitted = physical.bytes_upload;
                        snapshot = Some(status.clone());
                        Ok(status)
                    }),
                )
                .await;
            match outcome {
                Ok(()) => {
                    if let Some(status) = &snapshot {
                        self.sink.update_interface_metrics(&iface, status);
                    }
                }
                Err(e) => warn!(interface = %id, error = %e, "failed to store interface status"),
            }
        }
        Ok(())
    }

    /// One pass over peer counters and handshakes.
    ///
    /// Peers present on a device but unknown to the repository get a status
    /// row too; only known peers reach the metrics sink.
    ///
    /// # Errors
    ///
    /// Fails only when the interface list cannot be loaded.
    pub async fn collect_peer_data(&self) -> Result<()> {
        for iface in self.db.interfaces().await? {
            let id = &iface.identifier;
            let physical = match self.physical_peers(&iface.backend, id).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!(interface = %id, error = %e, "failed to fetch peers for data collection");
                    continue;
                }
            };
            let known: HashMap<PublicKey, Peer> = self
                .db
                .interface_peers(id)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|p| (p.interface.public_key, p))
                .collect();

            for pp in physical {
                let peer_id = pp.public_key.to_base64();
                match self.store_peer_counters(&peer_id, &pp).await {
                    Ok(status) => {
                        if let Some(peer) = known.get(&pp.public_key) {
                            self.sink.update_peer_metrics(peer, &status);
                        }
                    }
                    Err(e) => warn!(interface = %id, peer = %peer_id, error = %e, "failed to store peer status"),
                }
            }
        }
        Ok(())
    }

    async fn store_peer_counters(&self, peer_id: &str, pp: &PhysicalPeer) -> Result<PeerStatus> {
        let now = Utc::now();
        // the device reports from its own point of view
        let received = pp.bytes_upload;
        let transmitted = pp.bytes_download;
        let mut snapshot = None;
        self.stats
            .update_peer_status(
                peer_id,
                repo_update(|current: Option<PeerStatus>| {
                    let mut status = current.unwrap_or_else(|| PeerStatus::new(peer_id));
                    status.last_session_start =
                        session_start(&status, received, transmitted, pp.last_handshake, now);
                    status.updated_at = now;
                    status.bytes_received = received;
                    status.bytes_transmitted = transmitted;
                    status.last_handshake = pp.last_handshake;
                    status.endpoint.clone_from(&pp.endpoint);
                    status.calc_connected(now);
                    snapshot = Some(status.clone());
                    Ok(status)
                }),
            )
            .await?;
        snapshot.ok_or_else(|| VpnError::Repository(format!("no status written for {peer_id}")))
    }

    /// Probes one peer and records whether it answered.
    ///
    /// Peers without a check address are recorded as not pingable without
    /// sending anything.
    ///
    /// # Errors
    ///
    /// Fails when the status row cannot be written.
    pub async fn check_peer(&self, peer: &Peer) -> Result<bool> {
        let pingable = self.probe(peer).await;
        trace!(peer = %peer.identifier, pingable, "ping check");

        let now = Utc::now();
        let mut snapshot = None;
        self.stats
            .update_peer_status(
                &peer.identifier,
                repo_update(|current: Option<PeerStatus>| {
                    let mut status =
                        current.unwrap_or_else(|| PeerStatus::new(peer.identifier.as_str()));
                    status.is_pingable = pingable;
                    status.last_ping = Some(now);
                    status.updated_at = now;
                    status.calc_connected(now);
                    snapshot = Some(status.clone());
                    Ok(status)
                }),
            )
            .await?;
        if let Some(status) = &snapshot {
            self.sink.update_peer_metrics(peer, status);
        }
        Ok(pingable)
    }

    async fn probe(&self, peer: &Peer) -> bool {
        let address = peer.check_alive_address();
        if address.is_empty() {
            return false;
        }
        let controller = match self.db.interface(&peer.interface_identifier).await {
            Ok(iface) => self.registry.resolve(&iface.backend),
            Err(_) => self.registry.local(),
        };
        let controller = match controller {
            Ok(c) => c,
            Err(e) => {
                debug!(peer = %peer.identifier, error = %e, "no controller to ping from");
                return false;
            }
        };
        // margin over the probe's own deadline for remote backends
        let deadline = PING_TIMEOUT + Duration::from_secs(1);
        match tokio::time::timeout(deadline, controller.ping(&address)).await {
            Ok(Ok(result)) => result.is_pingable(),
            Ok(Err(e)) => {
                debug!(peer = %peer.identifier, %address, error = %e, "ping failed");
                false
            }
            Err(_) => false,
        }
    }

    fn start_ping_workers(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let workers = self.cfg.statistics.ping_check_workers.max(1);
        let (tx, rx) = mpsc::channel::<Peer>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers + 1);

        for worker in 0..workers {
            let this = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        () = token.cancelled() => None,
                        peer = async { rx.lock().await.recv().await } => peer,
                    };
                    let Some(peer) = next else { break };
                    if let Err(e) = this.check_peer(&peer).await {
                        warn!(peer = %peer.identifier, error = %e, "failed to record ping result");
                    }
                }
                trace!(worker, "ping worker stopped");
            }));
        }

        let this = Arc::clone(self);
        let token = token.clone();
        let period = self.cfg.statistics.ping_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.enqueue_ping_checks(&tx, &token).await {
                            warn!(error = %e, "failed to queue ping checks");
                        }
                    }
                }
            }
            drop(tx);
            debug!("ping checks stopped");
        }));
        handles
    }

    async fn enqueue_ping_checks(
        &self,
        tx: &mpsc::Sender<Peer>,
        token: &CancellationToken,
    ) -> Result<()> {
        for iface in self.db.interfaces().await? {
            let peers = match self.db.interface_peers(&iface.identifier).await {
                Ok(peers) => peers,
                Err(e) => {
                    warn!(interface = %iface.identifier, error = %e, "failed to load peers for ping checks");
                    continue;
                }
            };
            for peer in peers {
                tokio::select! {
                    () = token.cancelled() => return Ok(()),
                    sent = tx.send(peer) => if sent.is_err() { return Ok(()) },
                }
            }
        }
        Ok(())
    }

    async fn physical_interface(&self, backend: &str, id: &str) -> Result<PhysicalInterface> {
        Ok(self.registry.resolve(backend)?.interface(id).await?)
    }

    async fn physical_peers(&self, backend: &str, id: &str) -> Result<Vec<PhysicalPeer>> {
        Ok(self.registry.resolve(backend)?.peers(id).await?)
    }
}

/// Runs `pass` on every tick of `period` until `token` is cancelled.
fn spawn_ticker<F, Fut>(
    token: CancellationToken,
    period: Duration,
    name: &'static str,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = pass().await {
                        warn!(collector = name, error = %e, "statistics pass failed");
                    }
                }
            }
        }
        debug!(collector = name, "statistics loop stopped");
    })
}
