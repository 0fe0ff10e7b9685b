//! Transport port.
//!
//! The accept layer hands the relay an already-upgraded connection. The
//! relay reads from it through [`FrameSource`] and writes to it by queueing
//! [`OutboundFrame`]s on the connection handle.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// WebSocket close code for a normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code used when the server is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// A frame received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// A frame queued for delivery to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: u16, reason: String },
}

/// Receive-side transport failure.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Receive failed: {0}")]
    Receive(String),
}

/// Inbound half of a client connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame.
    ///
    /// Returns `None` once the transport is closed.
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>>;
}

/// Channel-backed source, used by in-process clients and tests.
///
/// Dropping the sending half ends the stream.
#[async_trait]
impl FrameSource for mpsc::UnboundedReceiver<InboundFrame> {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        self.recv().await.map(Ok)
    }
}
