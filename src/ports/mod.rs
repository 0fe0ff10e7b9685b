//! Ports - Interfaces for external dependencies.
//!
//! Following hexagonal architecture, ports define the contracts between
//! the relay core and the outside world. Adapters implement these ports.
//!
//! - `ChatRepository` - Durable storage for users, channels and messages
//! - `FrameSource` - Inbound half of an upgraded client connection

mod chat_repository;
mod transport;

pub use chat_repository::ChatRepository;
pub use transport::{
    FrameSource, InboundFrame, OutboundFrame, TransportError, CLOSE_GOING_AWAY, CLOSE_NORMAL,
};
