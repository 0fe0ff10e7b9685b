//! WebSocket message types for the chat relay.
//!
//! Defines the protocol between server and connected clients:
//! - Client → Server: a JSON object with a `command` discriminant and the
//!   command's fields alongside it
//! - Server → Client: JSON objects tagged with `type`

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::chat::{Channel, Message, User};
use crate::domain::foundation::{ChannelId, MessageId, Timestamp, UserId};

use super::error::RelayError;

// ============================================
// Client → Server Messages
// ============================================

/// Decoded inbound request: the discriminant plus its remaining fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub command: String,
    pub payload: Map<String, Value>,
}

impl CommandEnvelope {
    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// `MalformedCommand` if the frame is not a JSON object or has no string
    /// `command` field.
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::MalformedCommand(format!("invalid JSON: {}", e)))?;

        let Value::Object(mut payload) = value else {
            return Err(RelayError::MalformedCommand(
                "expected a JSON object".to_string(),
            ));
        };

        match payload.remove("command") {
            Some(Value::String(command)) => Ok(Self { command, payload }),
            Some(_) => Err(RelayError::MalformedCommand(
                "'command' must be a string".to_string(),
            )),
            None => Err(RelayError::MalformedCommand(
                "missing 'command' field".to_string(),
            )),
        }
    }

    /// Deserialize the payload into a command-specific request.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, RelayError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            RelayError::MalformedCommand(format!("invalid '{}' payload: {}", self.command, e))
        })
    }
}

/// Command kinds understood by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    JoinChannel,
    LeaveChannel,
    SendMessage,
    GetMessages,
    Identify,
    CreateChannel,
    Ping,
    Disconnect,
}

impl CommandKind {
    pub fn parse(command: &str) -> Option<Self> {
        let kind = match command {
            "join-channel" => CommandKind::JoinChannel,
            "leave-channel" => CommandKind::LeaveChannel,
            "send-message" => CommandKind::SendMessage,
            "get-messages" => CommandKind::GetMessages,
            "identify" => CommandKind::Identify,
            "create-channel" => CommandKind::CreateChannel,
            "ping" => CommandKind::Ping,
            "disconnect" => CommandKind::Disconnect,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::JoinChannel => "join-channel",
            CommandKind::LeaveChannel => "leave-channel",
            CommandKind::SendMessage => "send-message",
            CommandKind::GetMessages => "get-messages",
            CommandKind::Identify => "identify",
            CommandKind::CreateChannel => "create-channel",
            CommandKind::Ping => "ping",
            CommandKind::Disconnect => "disconnect",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinChannelRequest {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveChannelRequest {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub channel_id: ChannelId,
    pub text: String,
    /// Falls back to the identified user when absent.
    #[serde(default)]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetMessagesRequest {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default = "default_channel_color")]
    pub color: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub restricted: bool,
}

fn default_channel_color() -> String {
    "#ffffff".to_string()
}

// ============================================
// Server → Client Messages
// ============================================

/// All message types that can be sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A message posted to a subscribed channel.
    Message(MessagePayload),

    /// Channel history, sent only to the requester.
    History(HistoryMessage),

    /// Subscription confirmed.
    Joined(JoinedMessage),

    /// Subscription dropped.
    Left(LeftMessage),

    /// Connection bound to a user.
    Identified(IdentifiedMessage),

    /// Heartbeat response.
    Pong(PongMessage),

    /// Error occurred.
    Error(ErrorMessage),
}

/// Flat author summary; credentials are never included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    pub color: String,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            color: user.color.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub name: String,
    pub color: String,
    pub owner_id: UserId,
    pub restricted: bool,
    pub locked: bool,
}

impl From<&Channel> for ChannelSummary {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id,
            name: channel.name.clone(),
            color: channel.color.clone(),
            owner_id: channel.owner_id,
            restricted: channel.restricted,
            locked: channel.password.as_deref().is_some_and(|p| !p.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub text: String,
    pub time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelSummary>,
}

impl MessagePayload {
    pub fn new(
        message: &Message,
        author: Option<UserSummary>,
        channel: Option<ChannelSummary>,
    ) -> Self {
        Self {
            id: message.id,
            channel_id: message.channel_id,
            user_id: message.user_id,
            text: message.text.clone(),
            time: message.time.to_rfc3339(),
            author,
            channel,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub channel_id: ChannelId,
    pub messages: Vec<MessagePayload>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedMessage {
    pub channel: ChannelSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeftMessage {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifiedMessage {
    pub user: UserSummary,
}

/// Heartbeat response.
#[derive(Debug, Clone, Serialize)]
pub struct PongMessage {
    pub timestamp: String,
}

impl PongMessage {
    pub fn now() -> Self {
        Self {
            timestamp: Timestamp::now().to_rfc3339(),
        }
    }
}

/// Error message sent to client.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMessage {
    pub kind: String,
    pub message: String,
    pub timestamp: String,
}

impl From<&RelayError> for ErrorMessage {
    fn from(err: &RelayError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            timestamp: Timestamp::now().to_rfc3339(),
        }
    }
}
