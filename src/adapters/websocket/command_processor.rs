//! Command routing for decoded client envelopes.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::chat::{Channel, NewChannel, NewMessage};
use crate::domain::foundation::{ChannelId, UserId};
use crate::ports::ChatRepository;

use super::connection::{ConnectionHandle, ConnectionId};
use super::error::RelayError;
use super::message_processor::MessageCommandProcessor;
use super::messages::{
    ChannelSummary, CommandEnvelope, CommandKind, CreateChannelRequest, GetMessagesRequest,
    IdentifyRequest, IdentifiedMessage, JoinChannelRequest, JoinedMessage, LeaveChannelRequest,
    LeftMessage, PongMessage, SendMessageRequest, ServerMessage, UserSummary,
};
use super::registry::ConnectionRegistry;
use super::sender::FrameSender;

/// What the session loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Close,
}

/// Entry point for decoded commands.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Handle one command from `connection_id`.
    ///
    /// Recoverable failures are reported to the client and yield
    /// `Dispatch::Continue`; only fatal errors are returned.
    async fn process_command(
        &self,
        envelope: CommandEnvelope,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError>;

    /// Release per-connection state. Called once per connection, before it
    /// is deregistered.
    fn user_disconnected(&self, connection_id: &ConnectionId);
}

pub struct ChatCommandProcessor {
    repository: Arc<dyn ChatRepository>,
    registry: Arc<ConnectionRegistry>,
    sender: Arc<dyn FrameSender>,
    messages: Arc<dyn MessageCommandProcessor>,
    guest_user: Option<UserId>,
}

impl ChatCommandProcessor {
    pub fn new(
        repository: Arc<dyn ChatRepository>,
        registry: Arc<ConnectionRegistry>,
        sender: Arc<dyn FrameSender>,
        messages: Arc<dyn MessageCommandProcessor>,
    ) -> Self {
        Self {
            repository,
            registry,
            sender,
            messages,
            guest_user: None,
        }
    }

    /// Attribute anonymous `send-message` commands to `guest_user`.
    pub fn with_guest_user(mut self, guest_user: Option<UserId>) -> Self {
        self.guest_user = guest_user;
        self
    }

    async fn route(
        &self,
        kind: CommandKind,
        envelope: &CommandEnvelope,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        match kind {
            CommandKind::JoinChannel => self.join_channel(envelope.parse()?, connection_id).await,
            CommandKind::LeaveChannel => self.leave_channel(envelope.parse()?, connection_id),
            CommandKind::SendMessage => self.send_message(envelope.parse()?, connection_id).await,
            CommandKind::GetMessages => self.get_messages(envelope.parse()?, connection_id).await,
            CommandKind::Identify => self.identify(envelope.parse()?, connection_id).await,
            CommandKind::CreateChannel => {
                self.create_channel(envelope.parse()?, connection_id).await
            }
            CommandKind::Ping => {
                self.reply(connection_id, &ServerMessage::Pong(PongMessage::now()));
                Ok(Dispatch::Continue)
            }
            CommandKind::Disconnect => {
                debug!(connection_id = %connection_id, "Client requested disconnect");
                Ok(Dispatch::Close)
            }
        }
    }

    async fn join_channel(
        &self,
        request: JoinChannelRequest,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        let channel = self.require_channel(request.channel_id).await?;
        let user = self.registry.lookup(connection_id).and_then(|h| h.user());
        if !channel.admits(user, request.password.as_deref()) {
            return Err(RelayError::ChannelLocked(channel.id));
        }

        if self.registry.subscribe(connection_id, channel.id) {
            info!(connection_id = %connection_id, channel_id = %channel.id, "Joined channel");
            self.reply(
                connection_id,
                &ServerMessage::Joined(JoinedMessage {
                    channel: ChannelSummary::from(&channel),
                }),
            );
        }
        Ok(Dispatch::Continue)
    }

    fn leave_channel(
        &self,
        request: LeaveChannelRequest,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        if self.registry.unsubscribe(connection_id, request.channel_id) {
            info!(connection_id = %connection_id, channel_id = %request.channel_id, "Left channel");
        }
        self.reply(
            connection_id,
            &ServerMessage::Left(LeftMessage {
                channel_id: request.channel_id,
            }),
        );
        Ok(Dispatch::Continue)
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        let bound = self
            .registry
            .lookup(connection_id)
            .as_ref()
            .and_then(ConnectionHandle::user);
        let user_id = request
            .user_id
            .or(bound)
            .or(self.guest_user)
            .ok_or(RelayError::NotIdentified)?;

        // A claimed `userId` names the author only; access follows the
        // connection's own identity.
        self.ensure_access(connection_id, request.channel_id, bound)
            .await?;

        let report = self
            .messages
            .broadcast_message(
                NewMessage::new(request.channel_id, user_id, request.text),
                connection_id,
            )
            .await?;
        if report.failed > 0 {
            warn!(
                channel_id = %request.channel_id,
                message_id = %report.message_id,
                failed = report.failed,
                "Message not delivered to every subscriber"
            );
        }
        Ok(Dispatch::Continue)
    }

    async fn get_messages(
        &self,
        request: GetMessagesRequest,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        let user = self.registry.lookup(connection_id).and_then(|h| h.user());
        self.ensure_access(connection_id, request.channel_id, user)
            .await?;
        self.messages
            .get_messages(request.channel_id, connection_id)
            .await?;
        Ok(Dispatch::Continue)
    }

    async fn identify(
        &self,
        request: IdentifyRequest,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        let user = self
            .repository
            .get_user(request.user_id)
            .await
            .map_err(|e| RelayError::from_repository(e, None, Some(request.user_id)))?
            .ok_or(RelayError::UserNotFound(request.user_id))?;

        let Some(handle) = self.registry.lookup(connection_id) else {
            return Ok(Dispatch::Continue);
        };
        handle.set_user(Some(user.id));
        info!(connection_id = %connection_id, user_id = %user.id, "Connection identified");

        self.reply(
            connection_id,
            &ServerMessage::Identified(IdentifiedMessage {
                user: UserSummary::from(&user),
            }),
        );
        Ok(Dispatch::Continue)
    }

    async fn create_channel(
        &self,
        request: CreateChannelRequest,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        let owner = self
            .registry
            .lookup(connection_id)
            .and_then(|h| h.user())
            .ok_or(RelayError::NotIdentified)?;

        let mut new = NewChannel::new(request.name, request.color, owner)
            .restricted(request.restricted);
        if let Some(password) = request.password {
            new = new.with_password(password);
        }
        new.validate()?;

        let channel = self
            .repository
            .create_channel(new)
            .await
            .map_err(|e| RelayError::from_repository(e, None, Some(owner)))?;
        info!(connection_id = %connection_id, channel_id = %channel.id, "Channel created");

        self.registry.subscribe(connection_id, channel.id);
        self.reply(
            connection_id,
            &ServerMessage::Joined(JoinedMessage {
                channel: ChannelSummary::from(&channel),
            }),
        );
        Ok(Dispatch::Continue)
    }

    async fn require_channel(&self, channel_id: ChannelId) -> Result<Channel, RelayError> {
        self.repository
            .get_channel(channel_id)
            .await
            .map_err(|e| RelayError::from_repository(e, Some(channel_id), None))?
            .ok_or(RelayError::ChannelNotFound(channel_id))
    }

    /// Connections that have not joined a locked channel may neither post to
    /// nor read from it.
    async fn ensure_access(
        &self,
        connection_id: &ConnectionId,
        channel_id: ChannelId,
        user: Option<UserId>,
    ) -> Result<(), RelayError> {
        if self.registry.is_subscribed(connection_id, channel_id) {
            return Ok(());
        }
        let channel = self.require_channel(channel_id).await?;
        if channel.admits(user, None) {
            Ok(())
        } else {
            Err(RelayError::ChannelLocked(channel_id))
        }
    }

    fn reply(&self, connection_id: &ConnectionId, message: &ServerMessage) {
        let Some(handle) = self.registry.lookup(connection_id) else {
            return;
        };
        if let Err(e) = self.sender.send(&handle, message) {
            debug!(connection_id = %connection_id, error = %e, "Reply dropped");
        }
    }
}

#[async_trait]
impl CommandProcessor for ChatCommandProcessor {
    async fn process_command(
        &self,
        envelope: CommandEnvelope,
        connection_id: &ConnectionId,
    ) -> Result<Dispatch, RelayError> {
        let result = match CommandKind::parse(&envelope.command) {
            Some(kind) => self.route(kind, &envelope, connection_id).await,
            None => Err(RelayError::UnknownCommand(envelope.command.clone())),
        };

        match result {
            Err(e) if !e.is_fatal() => {
                debug!(
                    connection_id = %connection_id,
                    command = %envelope.command,
                    kind = e.kind(),
                    error = %e,
                    "Command rejected"
                );
                self.sender.send_error(connection_id, &e);
                Ok(Dispatch::Continue)
            }
            other => other,
        }
    }

    fn user_disconnected(&self, connection_id: &ConnectionId) {
        let released = self.registry.unsubscribe_all(connection_id);
        let user = self.registry.lookup(connection_id).and_then(|h| {
            let user = h.user();
            h.set_user(None);
            user
        });
        info!(
            connection_id = %connection_id,
            user_id = ?user.map(|u| u.value()),
            subscriptions = released,
            "User disconnected"
        );
    }
}
