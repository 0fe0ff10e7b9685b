//! Chat channel reference data.

use crate::domain::foundation::{
    limit_text, require_text, ChannelId, Timestamp, UserId, ValidationError,
};

/// Maximum channel name length.
pub const CHANNEL_NAME_MAX_CHARS: usize = 50;

/// Maximum channel password length.
pub const CHANNEL_PASSWORD_MAX_CHARS: usize = 50;

/// A persisted, named topic that owns its messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub color: String,
    pub created: Timestamp,
    pub owner_id: UserId,
    pub password: Option<String>,
    pub restricted: bool,
}

impl Channel {
    /// Whether a join attempt with `password` may subscribe.
    ///
    /// Channels without a password admit everyone; the owner always passes.
    pub fn admits(&self, user: Option<UserId>, password: Option<&str>) -> bool {
        if user == Some(self.owner_id) {
            return true;
        }
        match self.password.as_deref() {
            None | Some("") => true,
            Some(expected) => password == Some(expected),
        }
    }
}

/// Input for creating a channel.
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub color: String,
    pub owner_id: UserId,
    pub password: Option<String>,
    pub restricted: bool,
}

impl NewChannel {
    pub fn new(name: impl Into<String>, color: impl Into<String>, owner_id: UserId) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            owner_id,
            password: None,
            restricted: false,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn restricted(mut self, restricted: bool) -> Self {
        self.restricted = restricted;
        self
    }

    /// Enforces the name and password limits.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("name", &self.name, CHANNEL_NAME_MAX_CHARS)?;
        if let Some(password) = &self.password {
            limit_text("password", password, CHANNEL_PASSWORD_MAX_CHARS)?;
        }
        Ok(())
    }
}
