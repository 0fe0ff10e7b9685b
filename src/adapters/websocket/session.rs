//! Per-connection session loop.
//!
//! ```text
//! Open ──register──▶ Receiving ──text──▶ Dispatching ──▶ Receiving
//!                        │                    │
//!                        │ close / EOF /      │ disconnect
//!                        │ shutdown           ▼
//!                        └──────────────▶ Closing ──▶ Closed
//! ```
//!
//! A fatal dispatch failure skips the close handshake and goes straight to
//! `Closed`. Either way `user_disconnected` runs exactly once and the
//! connection is deregistered before [`SessionLoop::run`] returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ports::{FrameSource, InboundFrame, CLOSE_GOING_AWAY, CLOSE_NORMAL};

use super::command_processor::{CommandProcessor, Dispatch};
use super::connection::{ConnectionHandle, ConnectionId};
use super::error::RelayError;
use super::messages::CommandEnvelope;
use super::registry::ConnectionRegistry;
use super::sender::FrameSender;

const CLOSED_BY_SERVER: &str = "Closed by server";
const SERVER_SHUTTING_DOWN: &str = "Server shutting down";
const WRITER_STOPPED: &str = "outbound writer stopped";

/// Shared collaborators every session loop needs.
#[derive(Clone)]
pub struct RelayContext {
    pub registry: Arc<ConnectionRegistry>,
    pub processor: Arc<dyn CommandProcessor>,
    pub sender: Arc<dyn FrameSender>,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Close frame received or the stream ended.
    ClientClosed,
    /// Client sent a `disconnect` command.
    ClientRequested,
    /// The handle left the open state underneath the loop.
    ServerClosed,
    /// Reading from the transport failed.
    TransportError(String),
    /// The server is shutting down.
    Shutdown,
    /// A fatal error aborted the session without a close handshake.
    Failed(RelayError),
    /// The connection could not be registered.
    RegistrationFailed(RelayError),
}

enum Exit {
    Graceful(SessionOutcome),
    Abrupt(RelayError),
}

/// Drives one connection from registration to deregistration.
pub struct SessionLoop<S> {
    handle: ConnectionHandle,
    source: S,
    context: RelayContext,
    shutdown: watch::Receiver<bool>,
    watch_shutdown: bool,
}

impl<S: FrameSource> SessionLoop<S> {
    pub fn new(
        handle: ConnectionHandle,
        source: S,
        context: RelayContext,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handle,
            source,
            context,
            shutdown,
            watch_shutdown: true,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        self.handle.id()
    }

    /// Run the session to completion. Never panics and never returns early:
    /// every exit path releases the connection's state.
    pub async fn run(mut self) -> SessionOutcome {
        let id = self.handle.id().clone();
        if let Err(e) = self.context.registry.add(id.clone(), self.handle.clone()) {
            error!(connection_id = %id, error = %e, "Failed to register connection");
            return SessionOutcome::RegistrationFailed(e);
        }
        info!(connection_id = %id, "Session opened");

        let exit = self.receive().await;
        self.context.processor.user_disconnected(&id);

        let outcome = match exit {
            Exit::Graceful(outcome) => {
                let (code, reason) = match outcome {
                    SessionOutcome::Shutdown => (CLOSE_GOING_AWAY, SERVER_SHUTTING_DOWN),
                    _ => (CLOSE_NORMAL, CLOSED_BY_SERVER),
                };
                if !self.handle.begin_close(code, reason) {
                    debug!(connection_id = %id, "Close frame not queued");
                }
                outcome
            }
            Exit::Abrupt(err) => {
                error!(connection_id = %id, kind = err.kind(), error = %err, "Session aborted");
                SessionOutcome::Failed(err)
            }
        };

        self.context.registry.remove(&id);
        info!(connection_id = %id, outcome = ?outcome, "Session closed");
        outcome
    }

    async fn receive(&mut self) -> Exit {
        if *self.shutdown.borrow() {
            return Exit::Graceful(SessionOutcome::Shutdown);
        }

        loop {
            if !self.handle.is_open() {
                return Exit::Graceful(SessionOutcome::ServerClosed);
            }

            let frame = tokio::select! {
                changed = self.shutdown.changed(), if self.watch_shutdown => {
                    match changed {
                        Ok(()) if *self.shutdown.borrow() => {
                            return Exit::Graceful(SessionOutcome::Shutdown);
                        }
                        Ok(()) => continue,
                        Err(_) => {
                            self.watch_shutdown = false;
                            continue;
                        }
                    }
                }
                _ = self.handle.writer_closed() => {
                    warn!(connection_id = %self.handle.id(), "Outbound writer stopped");
                    return Exit::Graceful(SessionOutcome::TransportError(
                        WRITER_STOPPED.to_string(),
                    ));
                }
                frame = self.source.next_frame() => frame,
            };

            match frame {
                None | Some(Ok(InboundFrame::Close)) => {
                    debug!(connection_id = %self.handle.id(), "Client closed connection");
                    return Exit::Graceful(SessionOutcome::ClientClosed);
                }
                Some(Err(e)) => {
                    warn!(connection_id = %self.handle.id(), error = %e, "Receive error");
                    return Exit::Graceful(SessionOutcome::TransportError(e.to_string()));
                }
                Some(Ok(InboundFrame::Ping(_) | InboundFrame::Pong(_))) => {}
                Some(Ok(InboundFrame::Binary(_))) => {
                    self.context.sender.send_error(
                        self.handle.id(),
                        &RelayError::MalformedCommand("binary frames are not supported".to_string()),
                    );
                }
                Some(Ok(InboundFrame::Text(text))) => {
                    match dispatch(&self.context, self.handle.id(), &text).await {
                        Ok(Dispatch::Continue) => {}
                        Ok(Dispatch::Close) => {
                            return Exit::Graceful(SessionOutcome::ClientRequested)
                        }
                        Err(e) => return Exit::Abrupt(e),
                    }
                }
            }
        }
    }
}

/// Decode and process one text frame. Recoverable errors are reported to the
/// client here; only fatal ones are returned.
async fn dispatch(
    context: &RelayContext,
    id: &ConnectionId,
    text: &str,
) -> Result<Dispatch, RelayError> {
    let envelope = match CommandEnvelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(connection_id = %id, error = %e, "Undecodable frame");
            context.sender.send_error(id, &e);
            return Ok(Dispatch::Continue);
        }
    };

    let command = envelope.command.clone();
    let result = AssertUnwindSafe(context.processor.process_command(envelope, id))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            Err(RelayError::Internal(format!(
                "handler for '{}' panicked",
                command
            )))
        });

    match result {
        Err(e) if !e.is_fatal() => {
            context.sender.send_error(id, &e);
            Ok(Dispatch::Continue)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryChatRepository;
    use crate::adapters::websocket::command_processor::ChatCommandProcessor;
    use crate::adapters::websocket::message_processor::ChatMessageProcessor;
    use crate::adapters::websocket::sender::WebSocketSender;
    use crate::ports::{ChatRepository, OutboundFrame, TransportError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Counts disconnect notifications and delegates everything else.
    struct CountingProcessor {
        inner: Arc<dyn CommandProcessor>,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl CommandProcessor for CountingProcessor {
        async fn process_command(
            &self,
            envelope: CommandEnvelope,
            connection_id: &ConnectionId,
        ) -> Result<Dispatch, RelayError> {
            if envelope.command == "explode" {
                panic!("boom");
            }
            self.inner.process_command(envelope, connection_id).await
        }

        fn user_disconnected(&self, connection_id: &ConnectionId) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            self.inner.user_disconnected(connection_id);
        }
    }

    struct Harness {
        repository: Arc<InMemoryChatRepository>,
        registry: Arc<ConnectionRegistry>,
        processor: Arc<CountingProcessor>,
        context: RelayContext,
        shutdown: watch::Sender<bool>,
    }

    fn harness() -> Harness {
        let repository = Arc::new(InMemoryChatRepository::seeded());
        let store: Arc<dyn ChatRepository> = repository.clone();
        let registry = Arc::new(ConnectionRegistry::new());
        let sender: Arc<dyn FrameSender> = Arc::new(WebSocketSender::new(Arc::clone(&registry)));
        let messages = Arc::new(ChatMessageProcessor::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&sender),
        ));
        let processor = Arc::new(CountingProcessor {
            inner: Arc::new(ChatCommandProcessor::new(
                store,
                Arc::clone(&registry),
                Arc::clone(&sender),
                messages,
            )),
            disconnects: AtomicUsize::new(0),
        });
        let context = RelayContext {
            registry: Arc::clone(&registry),
            processor: processor.clone(),
            sender,
        };
        let (shutdown, _) = watch::channel(false);
        Harness {
            repository,
            registry,
            processor,
            context,
            shutdown,
        }
    }

    struct Client {
        id: ConnectionId,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        outbound: mpsc::Receiver<OutboundFrame>,
        task: tokio::task::JoinHandle<SessionOutcome>,
    }

    impl Client {
        fn send(&self, json: &str) {
            self.inbound
                .send(InboundFrame::Text(json.to_string()))
                .unwrap();
        }

        async fn recv(&mut self) -> OutboundFrame {
            tokio::time::timeout(std::time::Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("outbound queue closed")
        }

        async fn recv_json(&mut self) -> Value {
            match self.recv().await {
                OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected text frame, got {:?}", other),
            }
        }
    }

    fn spawn_client(h: &Harness) -> Client {
        let (handle, outbound) = ConnectionHandle::channel(ConnectionId::new(), 32);
        let (inbound, source) = mpsc::unbounded_channel();
        let id = handle.id().clone();
        let session = SessionLoop::new(handle, source, h.context.clone(), h.shutdown.subscribe());
        Client {
            id,
            inbound,
            outbound,
            task: tokio::spawn(session.run()),
        }
    }

    async fn wait_registered(h: &Harness, id: &ConnectionId) {
        for _ in 0..100 {
            if h.registry.contains(id) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("connection {} never registered", id);
    }

    #[tokio::test]
    async fn malformed_frame_is_reported_and_session_continues() {
        let h = harness();
        let mut client = spawn_client(&h);

        client.send("{not json");
        assert_eq!(client.recv_json().await["kind"], "MALFORMED_COMMAND");

        client.send(r#"{"command":"ping"}"#);
        assert_eq!(client.recv_json().await["type"], "pong");
        assert!(h.registry.contains(&client.id));
    }

    #[tokio::test]
    async fn binary_frame_is_reported_as_malformed() {
        let h = harness();
        let mut client = spawn_client(&h);

        client.inbound.send(InboundFrame::Binary(vec![1, 2, 3])).unwrap();

        assert_eq!(client.recv_json().await["kind"], "MALFORMED_COMMAND");
    }

    #[tokio::test]
    async fn disconnect_command_closes_gracefully() {
        let h = harness();
        let mut client = spawn_client(&h);
        client.send(r#"{"command":"join-channel","channelId":1}"#);
        client.recv_json().await;

        client.send(r#"{"command":"disconnect"}"#);

        assert_eq!(
            client.recv().await,
            OutboundFrame::Close {
                code: CLOSE_NORMAL,
                reason: CLOSED_BY_SERVER.to_string()
            }
        );
        assert_eq!(client.task.await.unwrap(), SessionOutcome::ClientRequested);
        assert!(!h.registry.contains(&client.id));
        assert!(h.registry.subscribers(crate::domain::foundation::ChannelId::new(1)).is_empty());
        assert_eq!(h.processor.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_close_frame_ends_session() {
        let h = harness();
        let client = spawn_client(&h);

        client.inbound.send(InboundFrame::Close).unwrap();

        assert_eq!(client.task.await.unwrap(), SessionOutcome::ClientClosed);
        assert_eq!(h.processor.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn end_of_stream_ends_session() {
        let h = harness();
        let client = spawn_client(&h);
        wait_registered(&h, &client.id).await;

        drop(client.inbound);

        assert_eq!(client.task.await.unwrap(), SessionOutcome::ClientClosed);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn transport_error_ends_session_once() {
        struct FailingSource;

        #[async_trait]
        impl FrameSource for FailingSource {
            async fn next_frame(&mut self) -> Option<Result<InboundFrame, TransportError>> {
                Some(Err(TransportError::Receive("reset by peer".to_string())))
            }
        }

        let h = harness();
        let (handle, _outbound) = ConnectionHandle::channel(ConnectionId::new(), 4);
        let session = SessionLoop::new(handle, FailingSource, h.context.clone(), h.shutdown.subscribe());

        let outcome = session.run().await;

        assert!(matches!(outcome, SessionOutcome::TransportError(m) if m.contains("reset")));
        assert_eq!(h.processor.disconnects.load(Ordering::SeqCst), 1);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn stopped_writer_ends_idle_session() {
        let h = harness();
        let client = spawn_client(&h);
        wait_registered(&h, &client.id).await;
        h.registry.subscribe(&client.id, crate::domain::foundation::ChannelId::new(1));

        drop(client.outbound);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(2), client.task)
            .await
            .expect("session should end once its writer is gone")
            .unwrap();
        assert_eq!(outcome, SessionOutcome::TransportError(WRITER_STOPPED.to_string()));
        assert!(h.registry.is_empty());
        assert!(h.registry.subscribers(crate::domain::foundation::ChannelId::new(1)).is_empty());
        assert_eq!(h.processor.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistence_failure_aborts_without_close_frame() {
        let h = harness();
        let mut client = spawn_client(&h);
        wait_registered(&h, &client.id).await;
        h.repository.set_write_failure(true);

        client.send(r#"{"command":"send-message","channelId":1,"text":"hi","userId":1}"#);

        let outcome = client.task.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Failed(RelayError::PersistenceError(_))));
        assert!(client.outbound.recv().await.is_none());
        assert!(!h.registry.contains(&client.id));
        assert_eq!(h.processor.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_is_contained() {
        let h = harness();
        let mut client = spawn_client(&h);
        let bystander = spawn_client(&h);
        wait_registered(&h, &bystander.id).await;

        client.send(r#"{"command":"explode"}"#);

        let outcome = client.task.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Failed(RelayError::Internal(_))));
        assert!(client.outbound.recv().await.is_none());
        assert!(h.registry.contains(&bystander.id));
    }

    #[tokio::test]
    async fn shutdown_closes_every_session_with_going_away() {
        let h = harness();
        let mut a = spawn_client(&h);
        let mut b = spawn_client(&h);
        wait_registered(&h, &a.id).await;
        wait_registered(&h, &b.id).await;

        h.shutdown.send(true).unwrap();

        for client in [&mut a, &mut b] {
            assert_eq!(
                client.recv().await,
                OutboundFrame::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: SERVER_SHUTTING_DOWN.to_string()
                }
            );
        }
        assert_eq!(a.task.await.unwrap(), SessionOutcome::Shutdown);
        assert_eq!(b.task.await.unwrap(), SessionOutcome::Shutdown);
        assert!(h.registry.is_empty());
        assert_eq!(h.processor.disconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dropped_shutdown_sender_does_not_end_sessions() {
        let h = harness();
        let (handle, mut outbound) = ConnectionHandle::channel(ConnectionId::new(), 4);
        let (inbound, source) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        let task = tokio::spawn(SessionLoop::new(handle, source, h.context.clone(), shutdown_rx).run());

        inbound.send(InboundFrame::Text(r#"{"command":"ping"}"#.to_string())).unwrap();
        assert!(matches!(outbound.recv().await, Some(OutboundFrame::Text(_))));

        drop(inbound);
        assert_eq!(task.await.unwrap(), SessionOutcome::ClientClosed);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let h = harness();
        let (handle, _outbound) = ConnectionHandle::channel(ConnectionId::new(), 4);
        h.registry.add(handle.id().clone(), handle.clone()).unwrap();
        let (_inbound, source) = mpsc::unbounded_channel();

        let outcome = SessionLoop::new(handle, source, h.context.clone(), h.shutdown.subscribe())
            .run()
            .await;

        assert!(matches!(
            outcome,
            SessionOutcome::RegistrationFailed(RelayError::DuplicateConnection(_))
        ));
        assert_eq!(h.processor.disconnects.load(Ordering::SeqCst), 0);
    }
}
