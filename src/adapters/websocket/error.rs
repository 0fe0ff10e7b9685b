//! Relay error taxonomy.

use thiserror::Error;

use crate::domain::foundation::{ChannelId, DomainError, ErrorCode, UserId, ValidationError};

use super::connection::ConnectionId;

/// Errors raised while handling connections and commands.
///
/// Everything except [`RelayError::PersistenceError`] and
/// [`RelayError::Internal`] is recoverable: it is reported to the client and
/// the session carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("Transport write failed: {0}")]
    TransportWrite(String),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Connection is not identified; send 'identify' or include 'userId'")]
    NotIdentified,

    #[error("Channel {0} requires a valid password")]
    ChannelLocked(ChannelId),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable identifier sent to clients in error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            RelayError::TransportWrite(_) => "TRANSPORT_WRITE",
            RelayError::UnknownCommand(_) => "UNKNOWN_COMMAND",
            RelayError::MalformedCommand(_) => "MALFORMED_COMMAND",
            RelayError::ChannelNotFound(_) => "CHANNEL_NOT_FOUND",
            RelayError::UserNotFound(_) => "USER_NOT_FOUND",
            RelayError::NotIdentified => "NOT_IDENTIFIED",
            RelayError::ChannelLocked(_) => "CHANNEL_LOCKED",
            RelayError::Validation(_) => "VALIDATION_FAILED",
            RelayError::PersistenceError(_) => "PERSISTENCE_ERROR",
            RelayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error ends the session that triggered it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::PersistenceError(_) | RelayError::Internal(_)
        )
    }

    /// Map a repository error, using the ids the call was made with.
    pub fn from_repository(err: DomainError, channel_id: Option<ChannelId>, user_id: Option<UserId>) -> Self {
        match (err.code, channel_id, user_id) {
            (ErrorCode::ChannelNotFound, Some(channel_id), _) => {
                RelayError::ChannelNotFound(channel_id)
            }
            (ErrorCode::UserNotFound, _, Some(user_id)) => RelayError::UserNotFound(user_id),
            (ErrorCode::ValidationFailed, _, _) => RelayError::Validation(err.message),
            _ => RelayError::PersistenceError(err.to_string()),
        }
    }
}

impl From<ValidationError> for RelayError {
    fn from(err: ValidationError) -> Self {
        RelayError::Validation(err.to_string())
    }
}
