//! Connection identity and the live transport handle.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::foundation::UserId;
use crate::ports::OutboundFrame;

/// Unique identifier for a WebSocket client connection.
///
/// Generated server-side when a client connects and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct HandleInner {
    id: ConnectionId,
    outbound: mpsc::Sender<OutboundFrame>,
    state: AtomicU8,
    user: RwLock<Option<UserId>>,
}

/// Live transport endpoint of one connection.
///
/// Writing means queueing an [`OutboundFrame`] for the connection's writer
/// task. Clones share the same endpoint and state; the registry's copy is
/// the authoritative one.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Wrap an existing outbound queue.
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                outbound,
                state: AtomicU8::new(ConnectionState::Open.as_u8()),
                user: RwLock::new(None),
            }),
        }
    }

    /// Create a handle with a fresh bounded queue, returning the queue's
    /// receiving end for the writer task.
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// User this connection speaks for, once identified.
    pub fn user(&self) -> Option<UserId> {
        *self.inner.user.read()
    }

    pub fn set_user(&self, user: Option<UserId>) {
        *self.inner.user.write() = user;
    }

    /// Queue a frame without waiting.
    pub(crate) fn try_enqueue(
        &self,
        frame: OutboundFrame,
    ) -> Result<(), mpsc::error::TrySendError<OutboundFrame>> {
        self.inner.outbound.try_send(frame)
    }

    /// Resolves once the writer task has dropped the receiving end of the
    /// outbound queue.
    pub async fn writer_closed(&self) {
        self.inner.outbound.closed().await
    }

    /// Move `Open → Closing` and queue a close frame.
    ///
    /// Returns `false` if the handle was not open or the frame could not be
    /// queued.
    pub fn begin_close(&self, code: u16, reason: &str) -> bool {
        let moved = self
            .inner
            .state
            .compare_exchange(
                ConnectionState::Open.as_u8(),
                ConnectionState::Closing.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        moved
            && self
                .try_enqueue(OutboundFrame::Close {
                    code,
                    reason: reason.to_string(),
                })
                .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.inner
            .state
            .store(ConnectionState::Closed.as_u8(), Ordering::Release);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("user", &self.user())
            .field("outbound_closed", &self.inner.outbound.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_id_displays_as_uuid() {
        assert_eq!(format!("{}", ConnectionId::new()).len(), 36);
    }

    #[test]
    fn new_handle_is_open() {
        let (handle, _rx) = ConnectionHandle::channel(ConnectionId::new(), 4);
        assert_eq!(handle.state(), ConnectionState::Open);
        assert!(handle.user().is_none());
    }

    #[test]
    fn begin_close_queues_close_frame_once() {
        let (handle, mut rx) = ConnectionHandle::channel(ConnectionId::new(), 4);

        assert!(handle.begin_close(1000, "bye"));
        assert!(!handle.begin_close(1000, "again"));

        assert_eq!(handle.state(), ConnectionState::Closing);
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Close {
                code: 1000,
                reason: "bye".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_state_and_user() {
        let (handle, _rx) = ConnectionHandle::channel(ConnectionId::new(), 4);
        let clone = handle.clone();

        clone.set_user(Some(UserId::new(3)));
        handle.mark_closed();

        assert_eq!(handle.user(), Some(UserId::new(3)));
        assert_eq!(clone.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn writer_closed_resolves_when_receiver_dropped() {
        let (handle, rx) = ConnectionHandle::channel(ConnectionId::new(), 4);
        drop(rx);

        tokio::time::timeout(std::time::Duration::from_secs(1), handle.writer_closed())
            .await
            .expect("writer_closed should resolve");
    }
}
