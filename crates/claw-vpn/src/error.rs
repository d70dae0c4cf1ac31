//! Error types for the reconciliation engine.

use claw_wireguard::WireGuardError;
use thiserror::Error;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum VpnError {
    /// Entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Lookup matched more than one entity.
    #[error("not unique: {0}")]
    NotUnique(String),

    /// Caller is not allowed to perform the operation.
    #[error("no permission: {0}")]
    NoPermission(String),

    /// Input failed validation.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// An entity with the same identifier already exists.
    #[error("duplicate entry: {0}")]
    DuplicateEntry(String),

    /// Device backend failure.
    #[error("controller error: {0}")]
    Controller(#[from] WireGuardError),

    /// A lifecycle hook or DNS action failed.
    #[error("hook for interface {interface} failed: {status}")]
    Hook {
        /// Interface the hook ran for.
        interface: String,
        /// Exit status or failure description, without the command line.
        status: String,
    },

    /// Persistence failure.
    #[error("repository error: {0}")]
    Repository(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The metrics endpoint could not bind or stopped serving.
    #[error("metrics endpoint error: {0}")]
    Metrics(String),

    /// An error annotated with the operation and object it happened on.
    #[error("{op} {id}: {source}")]
    Context {
        /// Operation name, e.g. `save interface`.
        op: &'static str,
        /// Object identifier.
        id: String,
        /// Underlying error.
        #[source]
        source: Box<VpnError>,
    },
}

impl VpnError {
    /// Wraps the error with the operation and identifier it belongs to.
    #[must_use]
    pub fn context(self, op: &'static str, id: impl Into<String>) -> Self {
        Self::Context {
            op,
            id: id.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context layers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the error reports a missing entity or a missing device object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Self::NotFound(_) => true,
            Self::Controller(e) => e.is_not_exist(),
            _ => false,
        }
    }

    /// Whether the error reports a missing physical object.
    #[must_use]
    pub fn is_not_exist(&self) -> bool {
        matches!(self.root(), Self::Controller(e) if e.is_not_exist())
    }
}

impl From<std::io::Error> for VpnError {
    fn from(e: std::io::Error) -> Self {
        Self::Repository(e.to_string())
    }
}

impl From<serde_json::Error> for VpnError {
    fn from(e: serde_json::Error) -> Self {
        Self::Repository(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for VpnError {
    fn from(e: ipnet::AddrParseError) -> Self {
        Self::InvalidData(e.to_string())
    }
}

/// Attaches operation context to a result.
pub trait ResultExt<T> {
    /// Wraps the error, if any, with `op` and `id`.
    fn context(self, op: &'static str, id: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<VpnError>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, op: &'static str, id: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(op, id))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, VpnError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_display() {
        let err = VpnError::NotFound("wg0".into()).context("save interface", "wg0");
        assert_eq!(err.to_string(), "save interface wg0: not found: wg0");
    }

    #[test]
    fn test_not_found_through_context() {
        let err = VpnError::Controller(WireGuardError::InterfaceNotFound("wg0".into()))
            .context("restore interface", "wg0");
        assert!(err.is_not_found());
        assert!(err.is_not_exist());

        let err = VpnError::NotFound("peer".into());
        assert!(err.is_not_found());
        assert!(!err.is_not_exist());
    }

    #[test]
    fn test_transport_error_is_not_not_found() {
        let err = VpnError::Controller(WireGuardError::Netlink("EPERM".into()));
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_hook_error_hides_command() {
        let err = VpnError::Hook {
            interface: "wg0".into(),
            status: "exit status: 1".into(),
        };
        assert_eq!(err.to_string(), "hook for interface wg0 failed: exit status: 1");
    }

    #[test]
    fn test_result_ext() {
        let res: std::result::Result<(), WireGuardError> =
            Err(WireGuardError::UnknownBackend("mt9".into()));
        let err = res.context("resolve backend", "wg1").expect_err("error");
        assert!(matches!(err.root(), VpnError::Controller(_)));
        assert!(err.to_string().starts_with("resolve backend wg1: "));
    }
}
