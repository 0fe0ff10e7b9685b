//! Domain layer containing business logic and domain types.
//!
//! # Module Organization
//!
//! - `foundation` - Shared domain primitives (IDs, timestamps, errors)
//! - `chat` - Users, channels and messages

pub mod chat;
pub mod foundation;
