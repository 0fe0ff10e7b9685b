//! Chat messages.

use crate::domain::foundation::{
    require_text, ChannelId, MessageId, Timestamp, UserId, ValidationError,
};

/// Maximum message text length in characters.
pub const MESSAGE_TEXT_MAX_CHARS: usize = 300;

/// A persisted message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub text: String,
    pub time: Timestamp,
}

/// A message that has been accepted from a client but not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub text: String,
}

impl NewMessage {
    pub fn new(channel_id: ChannelId, user_id: UserId, text: impl Into<String>) -> Self {
        Self {
            channel_id,
            user_id,
            text: text.into(),
        }
    }

    /// Text must be non-blank and at most 300 characters.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("text", &self.text, MESSAGE_TEXT_MAX_CHARS)
    }
}

/// Sorts history oldest first. Ties keep insertion order.
pub fn sort_by_time(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.time);
}
