//! `WireGuard` interface and peer reconciliation for Clawbernetes.
//!
//! The repository holds the desired state of interfaces and peers. The
//! [`Manager`] validates changes, writes them through the device
//! [`Controller`](claw_wireguard::Controller) of the interface's backend and
//! only then persists them. Background services follow the devices:
//!
//! - [`RouteSynchronizer`] maintains per-interface routing tables and the
//!   fwmark and main table rules in the kernel.
//! - [`StatisticsCollector`] polls counters and handshakes and runs ping
//!   checks.
//!
//! Components talk through the typed [`EventBus`].

pub mod allocator;
pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod hooks;
pub mod manager;
pub mod metrics;
pub mod repository;
pub mod retry;
pub mod routes;
pub mod stats;

pub use config::VpnConfig;
pub use domain::{CallerIdentity, Interface, Peer, User};
pub use error::{Result, VpnError};
pub use events::EventBus;
pub use hooks::{HookExecutor, ShellHookExecutor};
pub use manager::{ImportableInterface, Manager};
pub use metrics::{MetricsSink, PrometheusMetricsSink, TracingMetricsSink};
pub use repository::{MemoryRepository, Repositories};
pub use routes::RouteSynchronizer;
pub use stats::StatisticsCollector;
