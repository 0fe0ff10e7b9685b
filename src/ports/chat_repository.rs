//! Chat repository port.
//!
//! The relay never embeds storage logic. Everything it needs from durable
//! storage goes through this trait.
//!
//! # Design
//!
//! - **Flat records**: entities reference each other by id only
//! - **Store-side invariants**: cascading deletes are the store's business

use async_trait::async_trait;

use crate::domain::chat::{Channel, Message, NewChannel, NewUser, User};
use crate::domain::foundation::{ChannelId, DomainError, UserId};

/// Repository port for users, channels and messages.
#[async_trait]
pub trait ChatRepository: Send + Sync {
    /// Persist a new message and return it with its id and timestamp.
    ///
    /// # Errors
    ///
    /// - `ChannelNotFound` / `UserNotFound` if a referenced entity is missing
    /// - `DatabaseError` on persistence failure
    async fn create_message(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        text: &str,
    ) -> Result<Message, DomainError>;

    /// Fetch a channel's history ordered by timestamp ascending.
    ///
    /// # Errors
    ///
    /// - `ChannelNotFound` if the channel does not exist
    /// - `DatabaseError` on persistence failure
    async fn get_messages(&self, channel_id: ChannelId) -> Result<Vec<Message>, DomainError>;

    /// Find a channel by id.
    async fn get_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>, DomainError>;

    /// Find a user by id.
    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, DomainError>;

    /// Create a channel owned by `new.owner_id`.
    ///
    /// # Errors
    ///
    /// - `UserNotFound` if the owner does not exist
    /// - `DatabaseError` on persistence failure
    async fn create_channel(&self, new: NewChannel) -> Result<Channel, DomainError>;

    /// Register a user.
    async fn create_user(&self, new: NewUser) -> Result<User, DomainError>;
}
