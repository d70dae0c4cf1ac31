//! Interface lifecycle hooks and DNS actions.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use claw_wireguard::{WireGuardError, command};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Result, VpnError};

/// Runs shell hooks on behalf of an interface.
///
/// Empty commands are no-ops. A failing command fails the calling save.
#[async_trait]
pub trait HookExecutor: Send + Sync {
    /// Runs a pre/post up/down hook. `%i` expands to the interface name.
    async fn execute_interface_hook(&self, interface: &str, command: &str) -> Result<()>;

    /// Registers DNS servers and search domains for the interface.
    async fn set_dns(&self, interface: &str, dns: &str, search: &str) -> Result<()>;

    /// Removes the DNS registration of the interface.
    async fn unset_dns(&self, interface: &str) -> Result<()>;
}

/// Executes hooks with `bash -ce` and DNS changes with `resolvconf`.
#[derive(Debug, Clone)]
pub struct ShellHookExecutor {
    resolvconf_prefix: String,
    timeout: Duration,
}

impl ShellHookExecutor {
    /// Creates an executor; `resolvconf_prefix` is prepended to interface
    /// names in resolvconf records.
    pub fn new(resolvconf_prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            resolvconf_prefix: resolvconf_prefix.into(),
            timeout,
        }
    }

    fn expand(&self, command: &str, interface: &str) -> String {
        command
            .replace("%resPref", &self.resolvconf_prefix)
            .replace("%i", interface)
    }

    async fn run(&self, interface: &str, command: &str, stdin: &[String]) -> Result<()> {
        let expanded = self.expand(command, interface);
        debug!(interface, "executing interface hook");
        command::run("bash", &["-ce", &expanded], stdin, self.timeout)
            .await
            .map(|_| ())
            .map_err(|e| VpnError::Hook {
                interface: interface.to_string(),
                status: match e {
                    WireGuardError::Command { message, .. } => message,
                    other => other.to_string(),
                },
            })
    }
}

fn dns_lines(dns: &str, search: &str) -> Vec<String> {
    let mut lines: Vec<String> = dns
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("nameserver {s}"))
        .collect();
    let domains: Vec<&str> = search
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if !domains.is_empty() {
        lines.push(format!("search {}", domains.join(" ")));
    }
    lines
}

#[async_trait]
impl HookExecutor for ShellHookExecutor {
    async fn execute_interface_hook(&self, interface: &str, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Ok(());
        }
        self.run(interface, command, &[]).await
    }

    async fn set_dns(&self, interface: &str, dns: &str, search: &str) -> Result<()> {
        let lines = dns_lines(dns, search);
        if lines.is_empty() {
            return Ok(());
        }
        self.run(interface, "resolvconf -a %resPref%i -m 0 -x", &lines)
            .await
    }

    async fn unset_dns(&self, interface: &str) -> Result<()> {
        self.run(interface, "resolvconf -d %resPref%i -f", &[]).await
    }
}

/// One recorded hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookCall {
    /// A lifecycle hook.
    Hook {
        /// Interface name.
        interface: String,
        /// Command as configured.
        command: String,
    },
    /// DNS registration.
    SetDns {
        /// Interface name.
        interface: String,
        /// DNS servers.
        dns: String,
    },
    /// DNS removal.
    UnsetDns {
        /// Interface name.
        interface: String,
    },
}

/// Executor that only records calls. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingHookExecutor {
    calls: Mutex<Vec<HookCall>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingHookExecutor {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every hook of `interface` fail.
    pub fn fail_for(&self, interface: &str) {
        self.failing.lock().insert(interface.to_string());
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().clone()
    }

    /// Forgets recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, interface: &str, call: HookCall) -> Result<()> {
        if self.failing.lock().contains(interface) {
            return Err(VpnError::Hook {
                interface: interface.to_string(),
                status: "exit status: 1".to_string(),
            });
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl HookExecutor for RecordingHookExecutor {
    async fn execute_interface_hook(&self, interface: &str, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Ok(());
        }
        self.record(
            interface,
            HookCall::Hook {
                interface: interface.to_string(),
                command: command.to_string(),
            },
        )
    }

    async fn set_dns(&self, interface: &str, dns: &str, _search: &str) -> Result<()> {
        if dns.trim().is_empty() {
            return Ok(());
        }
        self.record(
            interface,
            HookCall::SetDns {
                interface: interface.to_string(),
                dns: dns.to_string(),
            },
        )
    }

    async fn unset_dns(&self, interface: &str) -> Result<()> {
        self.record(
            interface,
            HookCall::UnsetDns {
                interface: interface.to_string(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ShellHookExecutor {
        ShellHookExecutor::new("tun.", Duration::from_secs(5))
    }

    #[test]
    fn expands_placeholders() {
        let exec = executor();
        assert_eq!(
            exec.expand("resolvconf -d %resPref%i -f", "wg0"),
            "resolvconf -d tun.wg0 -f"
        );
        assert_eq!(exec.expand("iptables -A FORWARD -i %i", "wg1"), "iptables -A FORWARD -i wg1");
    }

    #[test]
    fn builds_resolvconf_input() {
        assert_eq!(
            dns_lines("1.1.1.1, 9.9.9.9", "corp.example, lab.example"),
            vec![
                "nameserver 1.1.1.1".to_string(),
                "nameserver 9.9.9.9".to_string(),
                "search corp.example lab.example".to_string(),
            ]
        );
        assert!(dns_lines("", "").is_empty());
    }

    #[tokio::test]
    async fn shell_hook_runs_with_interface_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("marker");
        let cmd = format!("echo %i > {}", marker.display());
        executor()
            .execute_interface_hook("wg5", &cmd)
            .await
            .expect("hook");
        let written = std::fs::read_to_string(&marker).expect("marker");
        assert_eq!(written.trim(), "wg5");
    }

    #[tokio::test]
    async fn failing_hook_hides_command() {
        let err = executor()
            .execute_interface_hook("wg0", "echo top-secret-token >/dev/null; exit 3")
            .await
            .expect_err("fails");
        let text = err.to_string();
        assert!(text.contains("wg0"));
        assert!(!text.contains("top-secret-token"));
    }

    #[tokio::test]
    async fn empty_hook_is_noop() {
        executor()
            .execute_interface_hook("wg0", "  ")
            .await
            .expect("noop");
    }

    #[tokio::test]
    async fn recorder_records_and_fails() {
        let rec = RecordingHookExecutor::new();
        rec.execute_interface_hook("wg0", "true").await.expect("hook");
        rec.set_dns("wg0", "1.1.1.1", "").await.expect("dns");
        rec.set_dns("wg0", "", "").await.expect("empty dns");
        assert_eq!(rec.calls().len(), 2);

        rec.fail_for("wg1");
        assert!(rec.unset_dns("wg1").await.is_err());
    }

    #[test]
    fn recorder_needs_no_runtime() {
        let rec = RecordingHookExecutor::new();
        tokio_test::block_on(rec.unset_dns("wg0")).expect("unset");
        assert_eq!(
            rec.calls(),
            vec![HookCall::UnsetDns {
                interface: "wg0".into()
            }]
        );
        rec.clear();
        assert!(rec.calls().is_empty());
    }
}
