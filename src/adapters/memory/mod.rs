//! In-process adapters.
//!
//! - `InMemoryChatRepository` - Chat storage for tests and local development

mod chat_repository;

pub use chat_repository::InMemoryChatRepository;
