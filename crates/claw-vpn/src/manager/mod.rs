//! Interface and peer manager.
//!
//! The repository holds the desired state and the manager is its only writer.
//! Every change is pushed onto the device through the controller registered
//! for the interface's backend, never by touching kernel or router state
//! directly.

mod interfaces;
mod peers;
mod sync;

use std::future::Future;
use std::sync::Arc;

use claw_wireguard::{BackendInfo, Controller, ControllerRegistry};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::VpnConfig;
use crate::domain::{
    CallerIdentity, Interface, InterfacePublicInfo, InterfaceType, Peer, PeerStatus, User,
};
use crate::error::{Result, ResultExt, VpnError};
use crate::events::EventBus;
use crate::hooks::HookExecutor;
use crate::repository::{
    InterfaceAndPeerRepository, Repositories, StatisticsRepository, UserRepository,
};

pub use interfaces::ImportableInterface;

/// Reconciles the repository's desired state with the devices.
pub struct Manager {
    cfg: Arc<VpnConfig>,
    registry: Arc<ControllerRegistry>,
    bus: EventBus,
    db: Arc<dyn InterfaceAndPeerRepository>,
    users: Arc<dyn UserRepository>,
    stats: Arc<dyn StatisticsRepository>,
    hooks: Arc<dyn HookExecutor>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("backends", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Creates a manager.
    pub fn new(
        cfg: Arc<VpnConfig>,
        registry: Arc<ControllerRegistry>,
        bus: EventBus,
        repos: &Repositories,
        hooks: Arc<dyn HookExecutor>,
    ) -> Self {
        Self {
            cfg,
            registry,
            bus,
            db: Arc::clone(&repos.interfaces),
            users: Arc::clone(&repos.users),
            stats: Arc::clone(&repos.statistics),
            hooks,
        }
    }

    /// Registered backends, ordered by id.
    pub fn backends(&self) -> Vec<BackendInfo> {
        self.registry.backends()
    }

    /// Event bus the manager publishes on.
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    fn controller(&self, backend: &str) -> Result<Arc<dyn Controller>> {
        Ok(self.registry.resolve(backend)?)
    }

    /// Controller of the interface stored under `interface`.
    async fn controller_for(&self, interface: &str) -> Result<(Interface, Arc<dyn Controller>)> {
        let iface = self.db.interface(interface).await?;
        let controller = self.controller(&iface.backend)?;
        Ok((iface, controller))
    }

    /// Runs `fut` under the configured operation deadline and tags failures
    /// with `op` and `id`.
    async fn bounded<T, F>(&self, op: &'static str, id: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let limit = self.cfg.advanced.operation_timeout();
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(|e| e.context(op, id)),
            Err(_) => Err(VpnError::Timeout(format!(
                "{op} {id} did not finish within {}s",
                limit.as_secs()
            ))),
        }
    }

    /// Every interface with its peers.
    ///
    /// # Errors
    ///
    /// Admin only.
    pub async fn get_all_interfaces_and_peers(
        &self,
        caller: &CallerIdentity,
    ) -> Result<Vec<(Interface, Vec<Peer>)>> {
        caller.require_admin()?;
        let mut out = Vec::new();
        for iface in self.db.interfaces().await? {
            let peers = self
                .db
                .interface_peers(&iface.identifier)
                .await
                .context("load peers of", iface.identifier.clone())?;
            out.push((iface, peers));
        }
        Ok(out)
    }

    /// One interface with its peers.
    ///
    /// # Errors
    ///
    /// Admin only; [`VpnError::NotFound`] for unknown interfaces.
    pub async fn get_interface_and_peers(
        &self,
        caller: &CallerIdentity,
        id: &str,
    ) -> Result<(Interface, Vec<Peer>)> {
        caller.require_admin()?;
        self.db.interface_and_peers(id).await
    }

    /// Public projection of the interfaces relevant to `user`.
    ///
    /// These are the interfaces the user owns peers on and, with
    /// self-provisioning enabled, every enabled server interface.
    ///
    /// # Errors
    ///
    /// Admins may query anyone; users only themselves.
    pub async fn get_user_interfaces(
        &self,
        caller: &CallerIdentity,
        user: &str,
    ) -> Result<Vec<InterfacePublicInfo>> {
        caller.require_admin_or_self(user)?;
        let peers = self.db.user_peers(user).await?;
        let self_service = self.cfg.core.self_provisioning_allowed;

        Ok(self
            .db
            .interfaces()
            .await?
            .into_iter()
            .filter(|iface| {
                peers.iter().any(|p| p.interface_identifier == iface.identifier)
                    || (self_service
                        && !iface.is_disabled()
                        && iface.interface_type == InterfaceType::Server)
            })
            .map(|iface| iface.public_info())
            .collect())
    }

    /// Status rows of every peer on an interface.
    ///
    /// # Errors
    ///
    /// Admin only.
    pub async fn get_peer_stats(
        &self,
        caller: &CallerIdentity,
        interface: &str,
    ) -> Result<Vec<PeerStatus>> {
        caller.require_admin()?;
        let (_, peers) = self.db.interface_and_peers(interface).await?;
        let ids: Vec<String> = peers.into_iter().map(|p| p.identifier).collect();
        self.stats.peer_statuses(&ids).await
    }

    /// Status rows of every peer a user owns.
    ///
    /// # Errors
    ///
    /// Admins may query anyone; users only themselves.
    pub async fn get_user_peer_stats(
        &self,
        caller: &CallerIdentity,
        user: &str,
    ) -> Result<Vec<PeerStatus>> {
        caller.require_admin_or_self(user)?;
        let ids: Vec<String> = self
            .db
            .user_peers(user)
            .await?
            .into_iter()
            .map(|p| p.identifier)
            .collect();
        self.stats.peer_statuses(&ids).await
    }

    async fn handle_user_created(&self, user: User) {
        if !self.cfg.core.create_default_peer {
            return;
        }
        if let Err(e) = self
            .create_default_peer(&CallerIdentity::system(), &user.identifier)
            .await
        {
            warn!(user = %user.identifier, error = %e, "failed to create default peer");
        }
    }

    /// Starts the user-event listener and the peer expiry sweep.
    pub fn start_background_jobs(self: &Arc<Self>, token: &CancellationToken) -> Vec<JoinHandle<()>> {
        let listener = {
            let manager = Arc::clone(self);
            self.bus
                .user_created
                .spawn_handler(token.child_token(), move |user| {
                    let manager = Arc::clone(&manager);
                    async move { manager.handle_user_created(user).await }
                })
        };

        let expiry = {
            let manager = Arc::clone(self);
            let token = token.child_token();
            tokio::spawn(async move { manager.run_expiry_check(token).await })
        };

        info!("manager background jobs started");
        vec![listener, expiry]
    }

    async fn run_expiry_check(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.cfg.statistics.collection_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.disable_expired_peers().await {
                        Ok(0) => {}
                        Ok(n) => info!(peers = n, "disabled expired peers"),
                        Err(e) => error!(error = %e, "peer expiry check failed"),
                    }
                }
            }
        }
        debug!("peer expiry check stopped");
    }

    /// Users known to the repository. Used by status tooling.
    ///
    /// # Errors
    ///
    /// Admin only.
    pub async fn get_users(&self, caller: &CallerIdentity) -> Result<Vec<User>> {
        caller.require_admin()?;
        self.users.users().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use claw_wireguard::{ControllerRegistry, LOCAL_BACKEND_ID, MemoryController};

    use super::Manager;
    use crate::config::VpnConfig;
    use crate::events::EventBus;
    use crate::hooks::RecordingHookExecutor;
    use crate::repository::{MemoryRepository, Repositories};

    /// A manager wired to in-memory collaborators.
    pub(crate) struct Harness {
        pub manager: Arc<Manager>,
        pub device: MemoryController,
        pub repo: Arc<MemoryRepository>,
        pub hooks: Arc<RecordingHookExecutor>,
    }

    pub(crate) fn harness_with(cfg: VpnConfig, bulk_replace: bool) -> Harness {
        let device = MemoryController::new(LOCAL_BACKEND_ID).with_bulk_replace(bulk_replace);
        let mut registry = ControllerRegistry::new();
        registry
            .register("Local", Arc::new(device.clone()))
            .expect("register");
        let repo = Arc::new(MemoryRepository::new());
        let hooks = Arc::new(RecordingHookExecutor::new());
        let manager = Manager::new(
            Arc::new(cfg),
            Arc::new(registry),
            EventBus::new(),
            &Repositories::shared(Arc::clone(&repo)),
            Arc::clone(&hooks) as Arc<dyn crate::hooks::HookExecutor>,
        );
        Harness {
            manager: Arc::new(manager),
            device,
            repo,
            hooks,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(VpnConfig::default(), false)
    }
}
