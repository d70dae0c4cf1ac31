//! Engine configuration.
//!
//! Loaded from TOML. Every section has defaults so a minimal file only needs
//! the backends it adds on top of the local one.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use claw_wireguard::{LOCAL_BACKEND_ID, MikrotikConfig};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VpnError};

/// Feature toggles of the reconciliation core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoreConfig {
    /// Users may create, edit and delete their own peers.
    pub self_provisioning_allowed: bool,
    /// Create a peer on every server interface when a user is created.
    pub create_default_peer: bool,
    /// Import unknown devices at startup.
    pub import_existing: bool,
    /// Push the database state onto the devices at startup.
    pub restore_state: bool,
    /// Users may change the key material of their peers.
    pub editable_keys: bool,
    /// JSON snapshot file of the repository; empty keeps state in memory only.
    pub state_file: PathBuf,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            self_provisioning_allowed: false,
            create_default_peer: false,
            import_existing: true,
            restore_state: true,
            editable_keys: true,
            state_file: PathBuf::from("/var/lib/claw-vpn/state.json"),
        }
    }
}

/// Allocation ranges, routing offsets and runtime tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdvancedConfig {
    /// First listen port probed for new interfaces.
    pub start_listen_port: u16,
    /// First IPv4 network probed for new interfaces.
    pub start_cidr_v4: String,
    /// First IPv6 network probed for new interfaces.
    pub start_cidr_v6: String,
    /// Allocate IPv6 addresses too.
    pub use_ip_v6: bool,
    /// Base for generated firewall marks and routing tables.
    pub route_table_offset: u32,
    /// Base priority of the main table fallback rule.
    pub rule_prio_offset: u32,
    /// Prefix of resolvconf interface records.
    pub resolvconf_prefix: String,
    /// Deadline for a single request-driven operation, in seconds.
    pub operation_timeout_secs: u64,
    /// Log as JSON lines.
    pub log_json: bool,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            start_listen_port: 51820,
            start_cidr_v4: "10.11.12.0/24".to_string(),
            start_cidr_v6: "fdfd:d3ad:c0de:1234::0/64".to_string(),
            use_ip_v6: true,
            route_table_offset: 20000,
            rule_prio_offset: 20000,
            resolvconf_prefix: "tun.".to_string(),
            operation_timeout_secs: 30,
            log_json: false,
        }
    }
}

impl AdvancedConfig {
    /// Parsed IPv4 start network.
    pub fn start_v4(&self) -> Result<IpNet> {
        parse_net("advanced.start_cidr_v4", &self.start_cidr_v4)
    }

    /// Parsed IPv6 start network.
    pub fn start_v6(&self) -> Result<IpNet> {
        parse_net("advanced.start_cidr_v6", &self.start_cidr_v6)
    }

    /// Request deadline.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn parse_net(field: &str, raw: &str) -> Result<IpNet> {
    raw.parse()
        .map_err(|e| VpnError::Config(format!("{field} is not a CIDR: {e}")))
}

/// Statistics collector settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StatisticsConfig {
    /// Probe peers with ICMP.
    pub use_ping_checks: bool,
    /// Parallel probes.
    pub ping_check_workers: usize,
    /// Seconds between probe rounds.
    pub ping_check_interval_secs: u64,
    /// Seconds between counter polls.
    pub data_collection_interval_secs: u64,
    /// Poll interface counters.
    pub collect_interface_data: bool,
    /// Poll peer counters and handshakes.
    pub collect_peer_data: bool,
    /// Address of the Prometheus `/metrics` endpoint; empty disables it.
    pub listening_address: String,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            use_ping_checks: true,
            ping_check_workers: 10,
            ping_check_interval_secs: 60,
            data_collection_interval_secs: 60,
            collect_interface_data: true,
            collect_peer_data: true,
            listening_address: "0.0.0.0:8787".to_string(),
        }
    }
}

impl StatisticsConfig {
    /// Probe interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_check_interval_secs)
    }

    /// Poll interval.
    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.data_collection_interval_secs)
    }

    /// Parsed metrics endpoint address, `None` when disabled.
    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>> {
        if self.listening_address.is_empty() {
            return Ok(None);
        }
        self.listening_address.parse().map(Some).map_err(|e| {
            VpnError::Config(format!(
                "statistics.listening_address '{}': {e}",
                self.listening_address
            ))
        })
    }
}

/// Device backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend used for new interfaces.
    pub default: String,
    /// Local interfaces never reported.
    pub ignored_local_interfaces: Vec<String>,
    /// `RouterOS` devices.
    pub mikrotik: Vec<MikrotikConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default: LOCAL_BACKEND_ID.to_string(),
            ignored_local_interfaces: Vec::new(),
            mikrotik: Vec::new(),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    /// Feature toggles.
    pub core: CoreConfig,
    /// Allocation and routing tuning.
    pub advanced: AdvancedConfig,
    /// Statistics collector.
    pub statistics: StatisticsConfig,
    /// Device backends.
    pub backend: BackendConfig,
}

impl VpnConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            VpnError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| VpnError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for mt in &self.backend.mikrotik {
            if mt.id.is_empty() {
                return Err(VpnError::Config("mikrotik backend id cannot be empty".to_string()));
            }
            if mt.id == LOCAL_BACKEND_ID {
                return Err(VpnError::Config(format!(
                    "backend id '{LOCAL_BACKEND_ID}' is reserved"
                )));
            }
            if !ids.insert(mt.id.as_str()) {
                return Err(VpnError::Config(format!("duplicate backend id '{}'", mt.id)));
            }
            if mt.api_url.is_empty() {
                return Err(VpnError::Config(format!("backend '{}' has no api_url", mt.id)));
            }
            if mt.concurrency == 0 {
                return Err(VpnError::Config(format!(
                    "backend '{}' concurrency must be greater than 0",
                    mt.id
                )));
            }
        }

        let default = self.backend.default.as_str();
        if !default.is_empty() && default != LOCAL_BACKEND_ID && !ids.contains(default) {
            return Err(VpnError::Config(format!(
                "default backend '{default}' is not configured"
            )));
        }

        self.advanced.start_v4()?;
        self.advanced.start_v6()?;
        if self.advanced.start_listen_port == 0 {
            return Err(VpnError::Config(
                "advanced.start_listen_port must be greater than 0".to_string(),
            ));
        }
        if self.advanced.operation_timeout_secs == 0 {
            return Err(VpnError::Config(
                "advanced.operation_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let stats = &self.statistics;
        if stats.ping_check_workers == 0 {
            return Err(VpnError::Config(
                "statistics.ping_check_workers must be greater than 0".to_string(),
            ));
        }
        if stats.ping_check_interval_secs == 0 || stats.data_collection_interval_secs == 0 {
            return Err(VpnError::Config(
                "statistics intervals must be greater than 0".to_string(),
            ));
        }
        stats.metrics_addr()?;

        Ok(())
    }

    /// Backend used for new interfaces.
    pub fn default_backend(&self) -> &str {
        if self.backend.default.is_empty() {
            LOCAL_BACKEND_ID
        } else {
            &self.backend.default
        }
    }
}
