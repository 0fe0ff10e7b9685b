//! PostgreSQL adapters - Database implementations for repository ports.
//!
//! - `PostgresChatRepository` - Users, channels and messages

mod chat_repository;

pub use chat_repository::PostgresChatRepository;
