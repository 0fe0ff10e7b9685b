//! Broadcast-on-send and history-on-request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::chat::{sort_by_time, Channel, Message, NewMessage};
use crate::domain::foundation::{ChannelId, MessageId, UserId};
use crate::ports::ChatRepository;

use super::connection::ConnectionId;
use super::error::RelayError;
use super::messages::{ChannelSummary, HistoryMessage, MessagePayload, ServerMessage, UserSummary};
use super::registry::ConnectionRegistry;
use super::sender::FrameSender;

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message_id: MessageId,
    /// Subscribers the message was queued for.
    pub delivered: usize,
    /// Subscribers whose write failed.
    pub failed: usize,
    /// Subscribers that disconnected before they could be written to.
    pub gone: usize,
}

/// Message-level operations used by the command processor.
#[async_trait]
pub trait MessageCommandProcessor: Send + Sync {
    /// Persist a message and deliver it to every subscriber of its channel.
    ///
    /// The origin connection is subscribed to the channel first when the
    /// channel admits it without a password, so the sender receives its own
    /// message. Already-subscribed origins always do.
    ///
    /// # Errors
    ///
    /// Validation and lookup failures are returned as recoverable errors;
    /// a failed write to the store is a `PersistenceError` and nothing is
    /// broadcast. Per-recipient send failures are never returned.
    async fn broadcast_message(
        &self,
        message: NewMessage,
        origin: &ConnectionId,
    ) -> Result<DeliveryReport, RelayError>;

    /// Send a channel's history, oldest first, to the requester only.
    ///
    /// An unknown channel is reported to the requester and is not an error.
    async fn get_messages(
        &self,
        channel_id: ChannelId,
        connection_id: &ConnectionId,
    ) -> Result<(), RelayError>;
}

/// Repository-backed message processor.
pub struct ChatMessageProcessor {
    repository: Arc<dyn ChatRepository>,
    registry: Arc<ConnectionRegistry>,
    sender: Arc<dyn FrameSender>,
}

impl ChatMessageProcessor {
    pub fn new(
        repository: Arc<dyn ChatRepository>,
        registry: Arc<ConnectionRegistry>,
        sender: Arc<dyn FrameSender>,
    ) -> Self {
        Self {
            repository,
            registry,
            sender,
        }
    }

    async fn author_summary(&self, user_id: UserId) -> Option<UserSummary> {
        match self.repository.get_user(user_id).await {
            Ok(user) => user.as_ref().map(UserSummary::from),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to resolve author");
                None
            }
        }
    }

    async fn load_channel(&self, channel_id: ChannelId) -> Option<Channel> {
        match self.repository.get_channel(channel_id).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(channel_id = %channel_id, error = %e, "Failed to resolve channel");
                None
            }
        }
    }

    async fn channel_summary(&self, channel_id: ChannelId) -> Option<ChannelSummary> {
        self.load_channel(channel_id)
            .await
            .as_ref()
            .map(ChannelSummary::from)
    }

    async fn history_payloads(&self, channel_id: ChannelId, history: &[Message]) -> Vec<MessagePayload> {
        let channel = self.channel_summary(channel_id).await;
        let mut authors: HashMap<UserId, Option<UserSummary>> = HashMap::new();

        let mut payloads = Vec::with_capacity(history.len());
        for message in history {
            if !authors.contains_key(&message.user_id) {
                let author = self.author_summary(message.user_id).await;
                authors.insert(message.user_id, author);
            }
            let author = authors.get(&message.user_id).cloned().flatten();
            payloads.push(MessagePayload::new(message, author, channel.clone()));
        }
        payloads
    }
}

#[async_trait]
impl MessageCommandProcessor for ChatMessageProcessor {
    async fn broadcast_message(
        &self,
        message: NewMessage,
        origin: &ConnectionId,
    ) -> Result<DeliveryReport, RelayError> {
        message.validate()?;

        let channel_id = message.channel_id;
        let user_id = message.user_id;
        let persisted = self
            .repository
            .create_message(channel_id, user_id, &message.text)
            .await
            .map_err(|e| RelayError::from_repository(e, Some(channel_id), Some(user_id)))?;

        let author = self.author_summary(user_id).await;
        let channel = self.load_channel(channel_id).await;
        let payload = ServerMessage::Message(MessagePayload::new(
            &persisted,
            author,
            channel.as_ref().map(ChannelSummary::from),
        ));

        // Locked channels are only entered through `join-channel`.
        let origin_user = self.registry.lookup(origin).and_then(|h| h.user());
        if channel.is_some_and(|c| c.admits(origin_user, None)) {
            self.registry.subscribe(origin, channel_id);
        }
        let recipients = self.registry.subscribers(channel_id);

        let mut delivered = 0;
        let mut failed = 0;
        let mut closed = 0;
        let visited = self.registry.for_each(&recipients, |handle| {
            match self.sender.send(handle, &payload) {
                Ok(()) => delivered += 1,
                Err(e) if !handle.is_open() => {
                    debug!(connection_id = %handle.id(), error = %e, "Recipient closing, skipped");
                    closed += 1;
                }
                Err(e) => {
                    warn!(
                        connection_id = %handle.id(),
                        message_id = %persisted.id,
                        error = %e,
                        "Failed to deliver message"
                    );
                    failed += 1;
                }
            }
        });

        let report = DeliveryReport {
            message_id: persisted.id,
            delivered,
            failed,
            gone: recipients.len() - visited + closed,
        };
        info!(
            channel_id = %channel_id,
            message_id = %persisted.id,
            delivered = report.delivered,
            failed = report.failed,
            gone = report.gone,
            "Message broadcast"
        );
        Ok(report)
    }

    async fn get_messages(
        &self,
        channel_id: ChannelId,
        connection_id: &ConnectionId,
    ) -> Result<(), RelayError> {
        let mut history = match self.repository.get_messages(channel_id).await {
            Ok(history) => history,
            Err(e) => {
                let err = RelayError::from_repository(e, Some(channel_id), None);
                if err.is_fatal() {
                    return Err(err);
                }
                self.sender.send_error(connection_id, &err);
                return Ok(());
            }
        };
        sort_by_time(&mut history);

        let messages = self.history_payloads(channel_id, &history).await;

        let Some(handle) = self.registry.lookup(connection_id) else {
            debug!(connection_id = %connection_id, "Requester gone before history was sent");
            return Ok(());
        };

        let count = messages.len();
        let reply = ServerMessage::History(HistoryMessage {
            channel_id,
            messages,
        });
        match self.sender.send(&handle, &reply) {
            Ok(()) => debug!(connection_id = %connection_id, channel_id = %channel_id, count, "History sent"),
            Err(e) => warn!(connection_id = %connection_id, error = %e, "Failed to send history"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryChatRepository;
    use crate::adapters::websocket::connection::ConnectionHandle;
    use crate::adapters::websocket::sender::WebSocketSender;
    use crate::domain::foundation::Timestamp;
    use crate::ports::OutboundFrame;
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Fixture {
        repository: Arc<InMemoryChatRepository>,
        registry: Arc<ConnectionRegistry>,
        processor: ChatMessageProcessor,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(InMemoryChatRepository::seeded());
        let registry = Arc::new(ConnectionRegistry::new());
        let sender: Arc<dyn FrameSender> = Arc::new(WebSocketSender::new(Arc::clone(&registry)));
        let processor = ChatMessageProcessor::new(
            repository.clone() as Arc<dyn ChatRepository>,
            Arc::clone(&registry),
            sender,
        );
        Fixture {
            repository,
            registry,
            processor,
        }
    }

    fn connect(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new(), 16);
        let id = handle.id().clone();
        registry.add(id.clone(), handle).unwrap();
        (id, rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
        match rx.try_recv().expect("expected a queued frame") {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    const GENERAL: ChannelId = ChannelId::new(1);
    const GUEST: UserId = UserId::new(1);

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_including_sender() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f.registry);
        let (b, mut rx_b) = connect(&f.registry);
        f.registry.subscribe(&b, GENERAL);

        let report = f
            .processor
            .broadcast_message(NewMessage::new(GENERAL, GUEST, "hi"), &a)
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 0);
        for rx in [&mut rx_a, &mut rx_b] {
            let json = next_json(rx);
            assert_eq!(json["type"], "message");
            assert_eq!(json["text"], "hi");
            assert_eq!(json["author"]["name"], "guest");
            assert_eq!(json["channel"]["name"], "general");
        }
        assert_eq!(f.repository.message_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_skips_other_channels() {
        let f = fixture();
        let (a, _rx_a) = connect(&f.registry);
        let (c, mut rx_c) = connect(&f.registry);
        f.registry.subscribe(&c, ChannelId::new(2));

        f.processor
            .broadcast_message(NewMessage::new(GENERAL, GUEST, "hi"), &a)
            .await
            .unwrap();

        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_does_not_subscribe_origin_to_locked_channel() {
        let f = fixture();
        let vault = f
            .repository
            .create_channel(
                crate::domain::chat::NewChannel::new("vault", "#000", GUEST).with_password("sesame"),
            )
            .await
            .unwrap();
        let (member, mut rx_member) = connect(&f.registry);
        let (outsider, mut rx_outsider) = connect(&f.registry);
        f.registry.subscribe(&member, vault.id);

        let report = f
            .processor
            .broadcast_message(NewMessage::new(vault.id, GUEST, "psst"), &outsider)
            .await
            .unwrap();

        assert_eq!(report.delivered, 1);
        assert!(!f.registry.is_subscribed(&outsider, vault.id));
        assert_eq!(next_json(&mut rx_member)["text"], "psst");
        assert!(rx_outsider.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_isolates_failed_recipients() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f.registry);
        let (b, rx_b) = connect(&f.registry);
        let (c, mut rx_c) = connect(&f.registry);
        f.registry.subscribe(&b, GENERAL);
        f.registry.subscribe(&c, GENERAL);
        drop(rx_b);

        let report = f
            .processor
            .broadcast_message(NewMessage::new(GENERAL, GUEST, "hi"), &a)
            .await
            .unwrap();

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(next_json(&mut rx_a)["text"], "hi");
        assert_eq!(next_json(&mut rx_c)["text"], "hi");
    }

    #[tokio::test]
    async fn broadcast_rejects_invalid_text_without_persisting() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f.registry);

        let err = f
            .processor
            .broadcast_message(NewMessage::new(GENERAL, GUEST, "   "), &a)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(f.repository.message_count(), 0);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_channel_is_channel_not_found() {
        let f = fixture();
        let (a, _rx_a) = connect(&f.registry);

        let err = f
            .processor
            .broadcast_message(NewMessage::new(ChannelId::new(99), GUEST, "hi"), &a)
            .await
            .unwrap_err();

        assert_eq!(err, RelayError::ChannelNotFound(ChannelId::new(99)));
        assert!(f.registry.subscriptions(&a).is_empty());
    }

    #[tokio::test]
    async fn broadcast_stops_on_persistence_failure() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f.registry);
        f.registry.subscribe(&a, GENERAL);
        f.repository.set_write_failure(true);

        let err = f
            .processor
            .broadcast_message(NewMessage::new(GENERAL, GUEST, "hi"), &a)
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn history_is_sorted_and_sent_only_to_requester() {
        let f = fixture();
        f.repository
            .insert_message_at(GENERAL, GUEST, "second", Timestamp::from_unix_millis(2_000));
        f.repository
            .insert_message_at(GENERAL, GUEST, "first", Timestamp::from_unix_millis(1_000));
        let (a, mut rx_a) = connect(&f.registry);
        let (b, mut rx_b) = connect(&f.registry);
        f.registry.subscribe(&b, GENERAL);

        f.processor.get_messages(GENERAL, &a).await.unwrap();

        let json = next_json(&mut rx_a);
        assert_eq!(json["type"], "history");
        let texts: Vec<&str> = json["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["text"].as_str().unwrap())
            .collect();
        assert_eq!(texts, vec!["first", "second"]);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn history_for_unknown_channel_reports_error_to_requester() {
        let f = fixture();
        let (a, mut rx_a) = connect(&f.registry);

        f.processor
            .get_messages(ChannelId::new(99), &a)
            .await
            .unwrap();

        let json = next_json(&mut rx_a);
        assert_eq!(json["type"], "error");
        assert_eq!(json["kind"], "CHANNEL_NOT_FOUND");
    }

    #[tokio::test]
    async fn history_for_departed_requester_is_dropped() {
        let f = fixture();
        let (a, _rx_a) = connect(&f.registry);
        f.registry.remove(&a);

        assert!(f.processor.get_messages(GENERAL, &a).await.is_ok());
    }
}
