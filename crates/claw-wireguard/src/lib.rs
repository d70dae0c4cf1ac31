//! `WireGuard` device backends.
//!
//! A [`Controller`] reads and writes the live state of one kind of device:
//! the local kernel (feature `linux`), a `RouterOS` router over REST, or an
//! in-memory fake. The [`ControllerRegistry`] resolves backend ids recorded on
//! interfaces to the controller that owns them. The [`netlink`] module holds the
//! kernel route and rule primitives used for policy routing.

pub mod command;
pub mod controller;
pub mod error;
mod keys;
#[cfg(feature = "linux")]
pub mod local;
pub mod locks;
pub mod memory;
pub mod mikrotik;
pub mod netlink;
pub mod ping;
pub mod registry;
pub mod types;

pub use controller::{Controller, PeerSetReplacer, UpdateFn, update_fn};
pub use error::{Result, WireGuardError};
pub use keys::{KEY_SIZE, KeyPair, PresharedKey, PrivateKey, PublicKey};
#[cfg(feature = "linux")]
pub use local::LocalController;
pub use memory::MemoryController;
pub use mikrotik::{MikrotikConfig, MikrotikController};
pub use registry::{BackendInfo, ControllerRegistry, LOCAL_BACKEND_ID};
pub use types::{
    BackendKind, DEFAULT_LISTEN_PORT, DEFAULT_MTU, InterfaceExtras, LocalPeerExtras,
    MikrotikInterfaceExtras, MikrotikPeerExtras, PeerExtras, PhysicalInterface, PhysicalPeer,
    PingResult,
};
