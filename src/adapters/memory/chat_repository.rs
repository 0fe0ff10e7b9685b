//! In-memory chat repository.
//!
//! Used by tests and by the binary when no database is configured. Keys are
//! assigned sequentially per entity type, starting at 1.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::chat::{Channel, Message, NewChannel, NewUser, User};
use crate::domain::foundation::{
    ChannelId, DomainError, ErrorCode, MessageId, Timestamp, UserId,
};
use crate::ports::ChatRepository;

#[derive(Default)]
struct Tables {
    users: HashMap<UserId, User>,
    channels: HashMap<ChannelId, Channel>,
    messages: Vec<Message>,
    next_user: i64,
    next_channel: i64,
    next_message: i64,
}

/// In-memory implementation of [`ChatRepository`].
///
/// Features:
/// - Foreign keys checked on insert, like the relational store
/// - Write-failure switch for exercising persistence outages
///
/// # Example
///
/// ```ignore
/// let repo = InMemoryChatRepository::seeded();
/// let history = repo.get_messages(ChannelId::new(1)).await?;
/// ```
#[derive(Default)]
pub struct InMemoryChatRepository {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl InMemoryChatRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a repository holding user 1 (`guest`) and channel 1 (`general`).
    pub fn seeded() -> Self {
        let repo = Self::new();
        {
            let mut tables = repo.tables.write();
            let guest = insert_user(&mut tables, NewUser::new("guest", "#7f8c8d"));
            insert_channel(
                &mut tables,
                NewChannel::new("general", "#2ecc71", guest.id),
            );
        }
        repo
    }

    // === Test Helpers ===

    /// Makes every subsequent message write fail with `DatabaseError`.
    pub fn set_write_failure(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    /// Returns count of persisted messages across all channels.
    pub fn message_count(&self) -> usize {
        self.tables.read().messages.len()
    }

    /// Returns persisted messages of one channel in insertion order.
    pub fn messages_in(&self, channel_id: ChannelId) -> Vec<Message> {
        self.tables
            .read()
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect()
    }

    /// Inserts a message with an explicit timestamp (for ordering tests).
    pub fn insert_message_at(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        text: &str,
        time: Timestamp,
    ) -> Message {
        let mut tables = self.tables.write();
        tables.next_message += 1;
        let message = Message {
            id: MessageId::new(tables.next_message),
            channel_id,
            user_id,
            text: text.to_string(),
            time,
        };
        tables.messages.push(message.clone());
        message
    }
}

fn insert_user(tables: &mut Tables, new: NewUser) -> User {
    tables.next_user += 1;
    let user = User {
        id: UserId::new(tables.next_user),
        name: new.name,
        color: new.color,
        joined: Timestamp::now(),
        password: new.password,
    };
    tables.users.insert(user.id, user.clone());
    user
}

fn insert_channel(tables: &mut Tables, new: NewChannel) -> Channel {
    tables.next_channel += 1;
    let channel = Channel {
        id: ChannelId::new(tables.next_channel),
        name: new.name,
        color: new.color,
        created: Timestamp::now(),
        owner_id: new.owner_id,
        password: new.password,
        restricted: new.restricted,
    };
    tables.channels.insert(channel.id, channel.clone());
    channel
}

fn channel_not_found(channel_id: ChannelId) -> DomainError {
    DomainError::new(
        ErrorCode::ChannelNotFound,
        format!("Channel not found: {}", channel_id),
    )
}

fn user_not_found(user_id: UserId) -> DomainError {
    DomainError::new(
        ErrorCode::UserNotFound,
        format!("User not found: {}", user_id),
    )
}

#[async_trait]
impl ChatRepository for InMemoryChatRepository {
    async fn create_message(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        text: &str,
    ) -> Result<Message, DomainError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DomainError::database("Failed to insert message: store unavailable"));
        }

        let mut tables = self.tables.write();
        if !tables.channels.contains_key(&channel_id) {
            return Err(channel_not_found(channel_id));
        }
        if !tables.users.contains_key(&user_id) {
            return Err(user_not_found(user_id));
        }

        tables.next_message += 1;
        let message = Message {
            id: MessageId::new(tables.next_message),
            channel_id,
            user_id,
            text: text.to_string(),
            time: Timestamp::now(),
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn get_messages(&self, channel_id: ChannelId) -> Result<Vec<Message>, DomainError> {
        let tables = self.tables.read();
        if !tables.channels.contains_key(&channel_id) {
            return Err(channel_not_found(channel_id));
        }

        let mut history: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| m.channel_id == channel_id)
            .cloned()
            .collect();
        history.sort_by_key(|m| m.time);
        Ok(history)
    }

    async fn get_channel(&self, channel_id: ChannelId) -> Result<Option<Channel>, DomainError> {
        Ok(self.tables.read().channels.get(&channel_id).cloned())
    }

    async fn get_user(&self, user_id: UserId) -> Result<Option<User>, DomainError> {
        Ok(self.tables.read().users.get(&user_id).cloned())
    }

    async fn create_channel(&self, new: NewChannel) -> Result<Channel, DomainError> {
        new.validate()?;
        let mut tables = self.tables.write();
        if !tables.users.contains_key(&new.owner_id) {
            return Err(user_not_found(new.owner_id));
        }
        Ok(insert_channel(&mut tables, new))
    }

    async fn create_user(&self, new: NewUser) -> Result<User, DomainError> {
        new.validate()?;
        Ok(insert_user(&mut self.tables.write(), new))
    }
}
