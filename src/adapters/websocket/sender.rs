//! Frame sender: serializes server messages onto connection queues.

use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::ports::OutboundFrame;

use super::connection::{ConnectionHandle, ConnectionId};
use super::error::RelayError;
use super::messages::{ErrorMessage, ServerMessage};
use super::registry::ConnectionRegistry;

/// Writes server messages to connections.
///
/// Implementations must never block: a slow or dead peer shows up as a
/// `TransportWrite` error for that peer only.
pub trait FrameSender: Send + Sync {
    /// Serialize `message` and queue it on `handle`.
    fn send(&self, handle: &ConnectionHandle, message: &ServerMessage) -> Result<(), RelayError>;

    /// Best-effort error notification. Silently dropped when the connection
    /// is gone or cannot be written to.
    fn send_error(&self, connection_id: &ConnectionId, error: &RelayError);
}

/// Production sender writing JSON text frames to connection queues.
pub struct WebSocketSender {
    registry: Arc<ConnectionRegistry>,
}

impl WebSocketSender {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

impl FrameSender for WebSocketSender {
    fn send(&self, handle: &ConnectionHandle, message: &ServerMessage) -> Result<(), RelayError> {
        if !handle.is_open() {
            return Err(RelayError::TransportWrite(format!(
                "connection {} is {}",
                handle.id(),
                handle.state()
            )));
        }

        let text = serde_json::to_string(message)
            .map_err(|e| RelayError::Internal(format!("failed to serialize message: {}", e)))?;

        handle
            .try_enqueue(OutboundFrame::Text(text))
            .map_err(|e| match e {
                TrySendError::Full(_) => RelayError::TransportWrite(format!(
                    "outbound queue full for connection {}",
                    handle.id()
                )),
                TrySendError::Closed(_) => RelayError::TransportWrite(format!(
                    "transport closed for connection {}",
                    handle.id()
                )),
            })
    }

    fn send_error(&self, connection_id: &ConnectionId, error: &RelayError) {
        let Some(handle) = self.registry.lookup(connection_id) else {
            debug!(connection_id = %connection_id, "Dropping error for unknown connection");
            return;
        };

        let message = ServerMessage::Error(ErrorMessage::from(error));
        if let Err(e) = self.send(&handle, &message) {
            warn!(
                connection_id = %connection_id,
                error = %e,
                kind = error.kind(),
                "Failed to deliver error notification"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::websocket::messages::PongMessage;
    use crate::domain::foundation::ChannelId;

    fn setup(capacity: usize) -> (
        Arc<ConnectionRegistry>,
        WebSocketSender,
        ConnectionHandle,
        tokio::sync::mpsc::Receiver<OutboundFrame>,
    ) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new(), capacity);
        registry.add(handle.id().clone(), handle.clone()).unwrap();
        let sender = WebSocketSender::new(Arc::clone(&registry));
        (registry, sender, handle, rx)
    }

    fn text_of(frame: OutboundFrame) -> String {
        match frame {
            OutboundFrame::Text(text) => text,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[test]
    fn send_queues_json_text_frame() {
        let (_registry, sender, handle, mut rx) = setup(4);

        sender
            .send(&handle, &ServerMessage::Pong(PongMessage::now()))
            .unwrap();

        let text = text_of(rx.try_recv().unwrap());
        assert!(text.contains(r#""type":"pong""#));
    }

    #[test]
    fn send_fails_when_queue_is_full() {
        let (_registry, sender, handle, _rx) = setup(1);
        let pong = ServerMessage::Pong(PongMessage::now());

        sender.send(&handle, &pong).unwrap();
        let err = sender.send(&handle, &pong).unwrap_err();

        assert!(matches!(err, RelayError::TransportWrite(m) if m.contains("full")));
    }

    #[test]
    fn send_fails_when_writer_is_gone() {
        let (_registry, sender, handle, rx) = setup(4);
        drop(rx);

        let err = sender
            .send(&handle, &ServerMessage::Pong(PongMessage::now()))
            .unwrap_err();

        assert!(matches!(err, RelayError::TransportWrite(_)));
    }

    #[test]
    fn send_fails_when_handle_is_closing() {
        let (_registry, sender, handle, _rx) = setup(4);
        handle.begin_close(1000, "bye");

        let err = sender
            .send(&handle, &ServerMessage::Pong(PongMessage::now()))
            .unwrap_err();

        assert!(matches!(err, RelayError::TransportWrite(m) if m.contains("closing")));
    }

    #[test]
    fn send_error_writes_error_frame() {
        let (_registry, sender, handle, mut rx) = setup(4);

        sender.send_error(handle.id(), &RelayError::ChannelNotFound(ChannelId::new(99)));

        let text = text_of(rx.try_recv().unwrap());
        assert!(text.contains(r#""type":"error""#));
        assert!(text.contains("CHANNEL_NOT_FOUND"));
    }

    #[test]
    fn send_error_ignores_unknown_and_dead_connections() {
        let (registry, sender, handle, rx) = setup(4);

        sender.send_error(&ConnectionId::new(), &RelayError::NotIdentified);

        drop(rx);
        sender.send_error(handle.id(), &RelayError::NotIdentified);

        registry.remove(handle.id());
        sender.send_error(handle.id(), &RelayError::NotIdentified);
    }
}
