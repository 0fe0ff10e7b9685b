//! Relay configuration

use serde::Deserialize;

use crate::domain::foundation::UserId;

use super::error::ValidationError;

const MAX_OUTBOUND_BUFFER: usize = 65_536;

/// Connection and storage behaviour of the relay itself.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Frames queued per connection before writes to it start failing
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Seed the in-memory store with a `guest` user and `general` channel
    #[serde(default = "default_seed_demo_data")]
    pub seed_demo_data: bool,

    /// Author of `send-message` commands from connections that neither
    /// identified nor named a `userId`. Unset rejects such messages.
    #[serde(default = "default_guest_user_id")]
    pub guest_user_id: Option<i64>,
}

impl RelayConfig {
    /// Validate relay configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.outbound_buffer == 0 || self.outbound_buffer > MAX_OUTBOUND_BUFFER {
            return Err(ValidationError::InvalidOutboundBuffer);
        }
        if matches!(self.guest_user_id, Some(id) if id <= 0) {
            return Err(ValidationError::InvalidGuestUser);
        }
        Ok(())
    }

    /// Default author for anonymous messages, if any.
    pub fn guest_user(&self) -> Option<UserId> {
        self.guest_user_id.map(UserId::new)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: default_outbound_buffer(),
            seed_demo_data: default_seed_demo_data(),
            guest_user_id: default_guest_user_id(),
        }
    }
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_seed_demo_data() -> bool {
    true
}

/// The seeded `guest` user.
fn default_guest_user_id() -> Option<i64> {
    Some(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_config_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.outbound_buffer, 256);
        assert!(config.seed_demo_data);
        assert_eq!(config.guest_user(), Some(UserId::new(1)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_guest_user_can_be_disabled() {
        let config = RelayConfig {
            guest_user_id: None,
            ..Default::default()
        };
        assert!(config.guest_user().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_guest_user_must_be_positive() {
        let config = RelayConfig {
            guest_user_id: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::InvalidGuestUser));
    }

    #[test]
    fn test_validation_outbound_buffer_bounds() {
        let config = RelayConfig {
            outbound_buffer: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::InvalidOutboundBuffer));

        let config = RelayConfig {
            outbound_buffer: MAX_OUTBOUND_BUFFER + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
