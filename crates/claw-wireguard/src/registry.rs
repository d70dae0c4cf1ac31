//! Backend registry.
//!
//! Maps backend identifiers to controllers. Interfaces with an empty or
//! unknown backend id resolve to the local backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::controller::Controller;
use crate::error::{Result, WireGuardError};
use crate::types::BackendKind;

/// Reserved identifier of the local backend.
pub const LOCAL_BACKEND_ID: &str = "local";

/// Display metadata of a registered backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Backend identifier.
    pub id: String,
    /// Human readable name.
    pub display_name: String,
    /// Backend family.
    pub kind: BackendKind,
}

struct Entry {
    info: BackendInfo,
    controller: Arc<dyn Controller>,
}

/// One controller per configured backend, fixed after startup.
#[derive(Default)]
pub struct ControllerRegistry {
    entries: BTreeMap<String, Entry>,
}

impl std::fmt::Debug for ControllerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.entries.values().map(|e| &e.info)).finish()
    }
}

impl ControllerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `controller` under its own id.
    ///
    /// # Errors
    ///
    /// Fails when the id is already taken.
    pub fn register(
        &mut self,
        display_name: impl Into<String>,
        controller: Arc<dyn Controller>,
    ) -> Result<()> {
        let id = controller.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(WireGuardError::InterfaceError(format!(
                "backend {id} registered twice"
            )));
        }
        let info = BackendInfo {
            id: id.clone(),
            display_name: display_name.into(),
            kind: controller.kind(),
        };
        debug!(backend = %id, kind = %info.kind, "backend controller registered");
        self.entries.insert(id, Entry { info, controller });
        Ok(())
    }

    /// Controller for the given backend id, falling back to the local one.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::UnknownBackend`] when neither the requested
    /// backend nor the local backend is registered.
    pub fn resolve(&self, backend: &str) -> Result<Arc<dyn Controller>> {
        let wanted = if backend.is_empty() { LOCAL_BACKEND_ID } else { backend };
        if let Some(entry) = self.entries.get(wanted) {
            return Ok(Arc::clone(&entry.controller));
        }
        let local = self
            .entries
            .get(LOCAL_BACKEND_ID)
            .ok_or_else(|| WireGuardError::UnknownBackend(LOCAL_BACKEND_ID.to_string()))?;
        warn!(backend = %wanted, "controller for backend not found, using local controller");
        Ok(Arc::clone(&local.controller))
    }

    /// The local controller.
    ///
    /// # Errors
    ///
    /// Returns [`WireGuardError::UnknownBackend`] when it is not registered.
    pub fn local(&self) -> Result<Arc<dyn Controller>> {
        self.entries
            .get(LOCAL_BACKEND_ID)
            .map(|e| Arc::clone(&e.controller))
            .ok_or_else(|| WireGuardError::UnknownBackend(LOCAL_BACKEND_ID.to_string()))
    }

    /// All controllers, ordered by id.
    #[must_use]
    pub fn controllers(&self) -> Vec<Arc<dyn Controller>> {
        self.entries.values().map(|e| Arc::clone(&e.controller)).collect()
    }

    /// Backend metadata, ordered by id.
    #[must_use]
    pub fn backends(&self) -> Vec<BackendInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    /// Whether `backend` names a registered backend.
    #[must_use]
    pub fn contains(&self, backend: &str) -> bool {
        self.entries.contains_key(backend)
    }
}
