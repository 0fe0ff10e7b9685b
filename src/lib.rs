//! Chat Relay - Real-time chat over WebSockets
//!
//! This crate accepts WebSocket connections, decodes JSON commands from
//! each client, persists chat messages and fans them out to every
//! connection subscribed to the message's channel.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
