use serde::{Deserialize, Serialize};

use crate::error::{Result, VpnError};

/// Identifier used for work the engine does on its own behalf.
pub const SYSTEM_USER: &str = "_system";

/// Who is calling an engine operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerIdentity {
    /// User identifier.
    pub user_id: String,
    /// Whether the caller has admin rights.
    pub is_admin: bool,
}

impl CallerIdentity {
    /// The engine itself; always admin.
    pub fn system() -> Self {
        Self::admin(SYSTEM_USER)
    }

    /// An admin caller.
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }

    /// A regular user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    /// Fails unless the caller is an admin.
    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(VpnError::NoPermission(format!("{} is not an admin", self.user_id)))
        }
    }

    /// Fails unless the caller is an admin or `owner` itself.
    pub fn require_admin_or_self(&self, owner: &str) -> Result<()> {
        if self.is_admin || (!owner.is_empty() && self.user_id == owner) {
            Ok(())
        } else {
            Err(VpnError::NoPermission(format!(
                "{} may not access objects of {owner}",
                self.user_id
            )))
        }
    }
}
