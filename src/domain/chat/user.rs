//! Chat user reference data.

use crate::domain::foundation::{limit_text, require_text, Timestamp, UserId, ValidationError};

/// Maximum display name length.
pub const USER_NAME_MAX_CHARS: usize = 200;

/// Maximum stored credential length.
pub const USER_PASSWORD_MAX_CHARS: usize = 200;

/// A persisted chat user.
///
/// The credential is carried for the store's benefit only; nothing in the
/// relay serializes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub color: String,
    pub joined: Timestamp,
    pub password: Option<String>,
}

/// Input for registering a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub color: String,
    pub password: Option<String>,
}

impl NewUser {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Enforces the name and credential limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("name", &self.name, USER_NAME_MAX_CHARS)?;
        if let Some(password) = &self.password {
            limit_text("password", password, USER_PASSWORD_MAX_CHARS)?;
        }
        Ok(())
    }
}
