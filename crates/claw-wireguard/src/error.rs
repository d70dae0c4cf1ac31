//! Error types for WireGuard device operations.

use thiserror::Error;

/// Errors that can occur while talking to a WireGuard backend.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid key format.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// The physical interface does not exist on the device.
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    /// The physical peer does not exist on the interface.
    #[error("peer not found: {peer} on {interface}")]
    PeerNotFound {
        /// Interface the peer was looked up on.
        interface: String,
        /// Public key of the missing peer.
        peer: String,
    },

    /// No controller is registered under the requested backend id.
    #[error("backend not registered: {0}")]
    UnknownBackend(String),

    /// Kernel netlink operation failed.
    #[error("netlink error: {0}")]
    Netlink(String),

    /// Kernel interface operation failed.
    #[error("interface error: {0}")]
    InterfaceError(String),

    /// Remote API rejected a request.
    #[error("api error {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message returned by the device.
        message: String,
    },

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed backend URL.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Malformed response from a backend.
    #[error("unexpected response: {0}")]
    Decode(String),

    /// External command failed.
    #[error("command `{program}` failed: {message}")]
    Command {
        /// Program that was executed.
        program: String,
        /// Captured error output.
        message: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireGuardError {
    /// Returns `true` when the error reports a missing physical object.
    ///
    /// Callers use this to choose between "create if missing" and failing hard.
    #[must_use]
    pub fn is_not_exist(&self) -> bool {
        match self {
            Self::InterfaceNotFound(_) | Self::PeerNotFound { .. } => true,
            Self::Api { status, .. } => *status == 404,
            _ => false,
        }
    }
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(e: base64::DecodeError) -> Self {
        Self::InvalidBase64(e.to_string())
    }
}

impl From<ipnet::AddrParseError> for WireGuardError {
    fn from(e: ipnet::AddrParseError) -> Self {
        Self::InvalidCidr(e.to_string())
    }
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, WireGuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_errors_are_not_exist() {
        assert!(WireGuardError::InterfaceNotFound("wg0".into()).is_not_exist());
        assert!(
            WireGuardError::PeerNotFound {
                interface: "wg0".into(),
                peer: "abc".into(),
            }
            .is_not_exist()
        );
        assert!(
            WireGuardError::Api {
                status: 404,
                message: "no such item".into(),
            }
            .is_not_exist()
        );
    }

    #[test]
    fn transport_errors_are_not_not_exist() {
        assert!(!WireGuardError::Netlink("EPERM".into()).is_not_exist());
        assert!(
            !WireGuardError::Api {
                status: 500,
                message: "boom".into(),
            }
            .is_not_exist()
        );
    }

    #[test]
    fn peer_not_found_display() {
        let err = WireGuardError::PeerNotFound {
            interface: "wg0".into(),
            peer: "key".into(),
        };
        assert_eq!(err.to_string(), "peer not found: key on wg0");
    }
}
