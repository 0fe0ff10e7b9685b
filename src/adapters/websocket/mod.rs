//! WebSocket adapters for the chat relay.
//!
//! This module owns the connection lifecycle: every accepted socket gets a
//! session loop that decodes commands, routes them, and fans messages out
//! to the connections subscribed to a channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │   GET /ws  ──upgrade──▶  handler (reader: SessionLoop, writer task) │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     │ text frames
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     ChatCommandProcessor                             │
//! │   join / leave / identify / create-channel / ping / disconnect      │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     │ send-message / get-messages
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     ChatMessageProcessor                             │
//! │   persist ─▶ resolve subscribers ─▶ WebSocketSender per recipient   │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                     │
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                     ConnectionRegistry                               │
//! │   connections      channel #1 → {a, b}      channel #2 → {b}        │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Components
//!
//! - [`connection`] - Connection ids and live handles
//! - [`registry`] - Connection registry and subscription index
//! - [`messages`] - WebSocket message protocol types
//! - [`sender`] - Non-blocking frame writes
//! - [`command_processor`] - Command routing
//! - [`message_processor`] - Broadcast and history
//! - [`session`] - Per-connection session loop
//! - [`handler`] - Axum WebSocket upgrade handler

pub mod command_processor;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message_processor;
pub mod messages;
pub mod registry;
pub mod sender;
pub mod session;

pub use command_processor::{ChatCommandProcessor, CommandProcessor, Dispatch};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState};
pub use error::RelayError;
pub use handler::{health_handler, websocket_router, ws_handler, WebSocketFrameSource, WebSocketState};
pub use message_processor::{ChatMessageProcessor, DeliveryReport, MessageCommandProcessor};
pub use messages::{
    ChannelSummary, CommandEnvelope, CommandKind, ErrorMessage, MessagePayload, ServerMessage,
    UserSummary,
};
pub use registry::ConnectionRegistry;
pub use sender::{FrameSender, WebSocketSender};
pub use session::{RelayContext, SessionLoop, SessionOutcome};
