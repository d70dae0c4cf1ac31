//! Per-object async locks.
//!
//! Devices have no compare-and-swap, so read-modify-write saves against the
//! same interface or peer are serialized through this table.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A lazily populated table of named mutexes.
#[derive(Debug, Default)]
pub struct ObjectLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ObjectLocks {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drops the entry for `key` once nobody holds it.
    pub fn forget(&self, key: &str) {
        self.locks.remove_if(key, |_, m| Arc::strong_count(m) == 1);
    }

    /// Key used for peer locks.
    #[must_use]
    pub fn peer_key(interface: &str, peer: &str) -> String {
        format!("{interface}/{peer}")
    }
}
