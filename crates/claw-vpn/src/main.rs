//! claw-vpnd - `WireGuard` reconciliation daemon
//!
//! Keeps local and remote `WireGuard` devices in line with the stored
//! interface and peer records, maintains policy routing and collects
//! statistics.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use claw_vpn::retry::{Backoff, retry_with_backoff};
use claw_vpn::{
    CallerIdentity, EventBus, Manager, MemoryRepository, MetricsSink, PrometheusMetricsSink,
    Repositories, RouteSynchronizer, ShellHookExecutor, StatisticsCollector, TracingMetricsSink,
    VpnConfig,
};
use claw_wireguard::netlink::NetlinkOps;
use claw_wireguard::{ControllerRegistry, MikrotikController};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "claw-vpnd")]
#[command(about = "WireGuard interface and peer reconciliation daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-vpn/config.toml", env = "CLAW_VPN_CONFIG")]
        config: PathBuf,
    },

    /// Validate a config file and print the backends it defines
    CheckConfig {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/claw-vpn/config.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let cfg = VpnConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_tracing(cfg.advanced.log_json)?;
            info!(config = %config.display(), "starting claw-vpnd");
            run(cfg).await?;
        }

        Commands::CheckConfig { config } => {
            let cfg = VpnConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            println!("config ok: {}", config.display());
            println!("  default backend: {}", cfg.default_backend());
            for mt in &cfg.backend.mikrotik {
                println!("  mikrotik {} ({}) at {}", mt.id, mt.display_name, mt.api_url);
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("claw_vpn=info".parse()?);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
    Ok(())
}

async fn run(cfg: VpnConfig) -> anyhow::Result<()> {
    let cfg = Arc::new(cfg);
    let token = CancellationToken::new();

    let (registry, netlink) = build_registry(&cfg)?;
    let registry = Arc::new(registry);
    for backend in registry.backends() {
        info!(backend = %backend.id, kind = %backend.kind, name = %backend.display_name, "backend ready");
    }

    let repo = if cfg.core.state_file.as_os_str().is_empty() {
        warn!("no state file configured, state is kept in memory only");
        MemoryRepository::new()
    } else {
        MemoryRepository::open(&cfg.core.state_file)?
    };
    let repos = Repositories::shared(Arc::new(repo));

    let bus = EventBus::new();
    let hooks = Arc::new(ShellHookExecutor::new(
        cfg.advanced.resolvconf_prefix.clone(),
        cfg.advanced.operation_timeout(),
    ));
    let manager = Arc::new(Manager::new(
        Arc::clone(&cfg),
        Arc::clone(&registry),
        bus.clone(),
        &repos,
        hooks,
    ));
    let routes = Arc::new(RouteSynchronizer::new(
        Arc::clone(&cfg),
        Arc::clone(&registry),
        &repos,
        netlink,
        bus.clone(),
    ));
    let mut handles = Vec::new();
    let sink: Arc<dyn MetricsSink> = match cfg.statistics.metrics_addr()? {
        Some(addr) => {
            let prometheus = Arc::new(PrometheusMetricsSink::new());
            let server = Arc::clone(&prometheus);
            let server_token = token.child_token();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.serve(addr, server_token).await {
                    error!(error = %e, "metrics endpoint failed");
                }
            }));
            prometheus
        }
        None => Arc::new(TracingMetricsSink),
    };
    let stats = Arc::new(StatisticsCollector::new(
        Arc::clone(&cfg),
        Arc::clone(&registry),
        &repos,
        sink,
    ));

    // route events published during startup must already be handled
    handles.extend(routes.start(&token));

    let system = CallerIdentity::system();
    let backoff = Backoff::default();
    if cfg.core.import_existing {
        let imported = retry_with_backoff(&token, &backoff, "import interfaces", || {
            manager.import_new_interfaces(&system, &[])
        })
        .await;
        if let Some(count) = imported {
            info!(count, "imported existing interfaces");
        }
    }
    if cfg.core.restore_state {
        let restored = retry_with_backoff(&token, &backoff, "restore interface state", || {
            manager.restore_interface_state(&system, true, &[])
        })
        .await;
        if restored.is_some() {
            info!("restored interface state");
        }
    }
    if let Err(e) = routes.sync_all().await {
        warn!(error = %e, "initial route synchronization failed");
    }

    handles.extend(stats.start(&token));
    handles.extend(manager.start_background_jobs(&token));
    info!(tasks = handles.len(), "claw-vpnd running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    token.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("claw-vpnd stopped");
    Ok(())
}

#[cfg(feature = "linux")]
fn build_registry(cfg: &VpnConfig) -> anyhow::Result<(ControllerRegistry, Arc<dyn NetlinkOps>)> {
    use claw_wireguard::LocalController;
    use claw_wireguard::netlink::RtNetlinkOps;

    let netlink: Arc<dyn NetlinkOps> =
        Arc::new(RtNetlinkOps::connect().context("connecting to rtnetlink")?);
    let local = LocalController::new(
        Arc::clone(&netlink),
        cfg.backend.ignored_local_interfaces.iter().cloned(),
    );
    let mut registry = ControllerRegistry::new();
    registry.register("Local", Arc::new(local))?;
    register_mikrotik(cfg, &mut registry)?;
    Ok((registry, netlink))
}

#[cfg(not(feature = "linux"))]
fn build_registry(cfg: &VpnConfig) -> anyhow::Result<(ControllerRegistry, Arc<dyn NetlinkOps>)> {
    use claw_wireguard::netlink::MemoryNetlink;
    use claw_wireguard::{LOCAL_BACKEND_ID, MemoryController};

    warn!("built without the linux feature, the local backend is simulated in memory");
    let mut registry = ControllerRegistry::new();
    registry.register("Local (in memory)", Arc::new(MemoryController::new(LOCAL_BACKEND_ID)))?;
    register_mikrotik(cfg, &mut registry)?;
    Ok((registry, Arc::new(MemoryNetlink::new())))
}

fn register_mikrotik(cfg: &VpnConfig, registry: &mut ControllerRegistry) -> anyhow::Result<()> {
    for mt in &cfg.backend.mikrotik {
        let controller = MikrotikController::new(mt)
            .with_context(|| format!("setting up mikrotik backend {}", mt.id))?;
        registry.register(mt.display_name.clone(), Arc::new(controller))?;
    }
    Ok(())
}
