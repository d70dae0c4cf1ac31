//! Logical model: interfaces, peers, users and status rows.

pub mod cidr;
mod identity;
mod interface;
mod options;
mod peer;
mod status;
mod user;

pub use identity::{CallerIdentity, SYSTEM_USER};
pub use interface::{
    Interface, InterfacePublicInfo, InterfaceType, PeerDefaults, RoutingTable, RoutingTableInfo,
};
pub use options::ConfigOption;
pub use peer::{Peer, PeerInterfaceConfig};
pub use status::{HANDSHAKE_STALENESS, InterfaceStatus, PeerStatus, is_recent};
pub use user::User;

/// Machine-readable disabled reasons.
pub mod reasons {
    /// The peer passed its expiry time.
    pub const EXPIRED: &str = "expired";
    /// Removed by an admin.
    pub const DELETED: &str = "deleted";
    /// Disabled by its owner.
    pub const USER_DISABLED: &str = "user disabled";
    /// Removed by its owner.
    pub const USER_DELETED: &str = "user deleted";
    /// Disabled by an admin.
    pub const ADMIN_DISABLED: &str = "disabled by admin";
    /// The device could not be created or updated.
    pub const MISSING_INTERFACE: &str = "missing WireGuard interface";
    /// Reported disabled by the device itself.
    pub const BACKEND_DISABLED: &str = "disabled by backend";
}

/// Value recorded in `created_by` for imported records.
pub const CREATED_BY_IMPORTER: &str = "importer";
