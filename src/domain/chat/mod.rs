//! Chat entities: users, channels and messages.
//!
//! References between entities are one-directional foreign keys. Looking
//! up the other side goes through the `ChatRepository` port.

mod channel;
mod message;
mod user;

pub use channel::{Channel, NewChannel, CHANNEL_NAME_MAX_CHARS, CHANNEL_PASSWORD_MAX_CHARS};
pub use message::{sort_by_time, Message, NewMessage, MESSAGE_TEXT_MAX_CHARS};
pub use user::{NewUser, User, USER_NAME_MAX_CHARS, USER_PASSWORD_MAX_CHARS};
