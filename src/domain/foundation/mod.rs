//! Foundation module - Shared domain primitives.
//!
//! Contains value objects, identifiers and error types
//! that form the vocabulary of the chat domain.

mod errors;
mod ids;
mod timestamp;

pub use errors::{limit_text, require_text, DomainError, ErrorCode, ValidationError};
pub use ids::{ChannelId, MessageId, UserId};
pub use timestamp::Timestamp;
