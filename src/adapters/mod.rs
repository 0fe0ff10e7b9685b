//! Adapters - Implementations of port interfaces.
//!
//! Adapters connect the relay core to external systems:
//! - `memory` - In-process chat storage
//! - `postgres` - PostgreSQL chat storage
//! - `websocket` - Connection registry, session loop and axum upgrade handler

pub mod memory;
pub mod postgres;
pub mod websocket;

pub use memory::InMemoryChatRepository;
pub use postgres::PostgresChatRepository;
