//! WebSocket upgrade handler for chat connections.
//!
//! Handles the HTTP → WebSocket upgrade and wires the socket to the relay:
//! 1. Upgrade to WebSocket
//! 2. Split the socket; the write half is owned by a writer task draining
//!    the connection's outbound queue
//! 3. Run the session loop on the read half until it ends
//! 4. Let the writer flush the close frame and exit

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::ports::{FrameSource, InboundFrame, OutboundFrame, TransportError};

use super::connection::{ConnectionHandle, ConnectionId};
use super::registry::ConnectionRegistry;
use super::session::{RelayContext, SessionLoop};

/// How long a finished session waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// State required for WebSocket handling.
#[derive(Clone)]
pub struct WebSocketState {
    pub relay: RelayContext,
    /// Flipped to `true` when the server starts shutting down.
    pub shutdown: watch::Receiver<bool>,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
}

impl WebSocketState {
    pub fn new(relay: RelayContext, shutdown: watch::Receiver<bool>, outbound_buffer: usize) -> Self {
        Self {
            relay,
            shutdown,
            outbound_buffer,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.relay.registry
    }
}

/// Handle WebSocket upgrade requests.
///
/// Route: `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebSocketState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: WebSocketState) {
    let (sink, stream) = socket.split();
    let (handle, outbound) = ConnectionHandle::channel(ConnectionId::new(), state.outbound_buffer);
    let connection_id = handle.id().clone();

    let writer = tokio::spawn(write_frames(sink, outbound, connection_id.clone()));

    let session = SessionLoop::new(
        handle,
        WebSocketFrameSource::new(stream),
        state.relay.clone(),
        state.shutdown.clone(),
    );
    let outcome = session.run().await;
    tracing::debug!(connection_id = %connection_id, outcome = ?outcome, "Socket session finished");

    finish_writer(writer, WRITER_DRAIN_TIMEOUT, &connection_id).await;
}

/// Wait for the writer to flush its last frames, aborting it when the peer
/// stops reading. Returns `true` if the writer finished on its own.
async fn finish_writer(
    mut writer: JoinHandle<()>,
    limit: Duration,
    connection_id: &ConnectionId,
) -> bool {
    match tokio::time::timeout(limit, &mut writer).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(connection_id = %connection_id, "Writer task failed: {}", e);
            false
        }
        Err(_) => {
            tracing::warn!(
                connection_id = %connection_id,
                timeout_ms = limit.as_millis() as u64,
                "Writer did not drain in time, aborting"
            );
            writer.abort();
            false
        }
    }
}

/// Drain a connection's outbound queue into the socket.
///
/// Ends after a close frame, on the first write error, or once every
/// handle to the queue has been dropped.
async fn write_frames<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    connection_id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    while let Some(frame) = outbound.recv().await {
        let (message, last) = match frame {
            OutboundFrame::Text(text) => (Message::Text(text), false),
            OutboundFrame::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };

        if let Err(e) = sink.send(message).await {
            tracing::debug!(
                connection_id = %connection_id,
                "Send error, closing connection: {}",
                e
            );
            break;
        }
        if last {
            break;
        }
    }
    outbound.close();
}

/// Read half of an axum WebSocket.
pub struct WebSocketFrameSource {
    stream: SplitStream<WebSocket>,
}

impl WebSocketFrameSource {
    pub fn new(stream: SplitStream<WebSocket>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl FrameSource for WebSocketFrameSource {
    async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        let result = self.stream.next().await?;
        Some(
            result
                .map(|message| match message {
                    Message::Text(text) => InboundFrame::Text(text),
                    Message::Binary(data) => InboundFrame::Binary(data),
                    Message::Ping(data) => InboundFrame::Ping(data),
                    Message::Pong(data) => InboundFrame::Pong(data),
                    Message::Close(_) => InboundFrame::Close,
                })
                .map_err(|e| TransportError::Receive(e.to_string())),
        )
    }
}

/// Liveness probe reporting the number of open connections.
///
/// Route: `GET /health`
pub async fn health_handler(State(state): State<WebSocketState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": state.registry().len(),
    }))
}

/// Create axum router for the relay endpoints.
///
/// # Example
///
/// ```ignore
/// let app = websocket_router().with_state(state);
/// ```
pub fn websocket_router() -> Router<WebSocketState> {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
}
