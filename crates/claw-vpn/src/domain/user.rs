use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A portal user as far as peer ownership is concerned.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    /// Unique identifier.
    pub identifier: String,
    /// E-mail address.
    pub email: String,
    /// Given name.
    pub firstname: String,
    /// Family name.
    pub lastname: String,
    /// Admin flag.
    pub is_admin: bool,
    /// When the user was disabled.
    pub disabled: Option<DateTime<Utc>>,
    /// Why the user was disabled.
    pub disabled_reason: String,
}

impl User {
    /// A user with only an identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Self::default()
        }
    }

    /// Whether the user carries a disabled timestamp.
    pub fn is_disabled(&self) -> bool {
        self.disabled.is_some()
    }

    /// Name used as display prefix for generated peers.
    pub fn display_name(&self) -> String {
        let full = format!("{} {}", self.firstname.trim(), self.lastname.trim());
        let full = full.trim();
        if full.is_empty() {
            self.identifier.clone()
        } else {
            full.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_identifier() {
        let mut user = User::new("alice");
        assert_eq!(user.display_name(), "alice");
        user.firstname = "Alice".into();
        assert_eq!(user.display_name(), "Alice");
        user.lastname = "Liddell".into();
        assert_eq!(user.display_name(), "Alice Liddell");
    }
}
