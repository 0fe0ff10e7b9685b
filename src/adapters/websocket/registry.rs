//! Connection registry and channel subscription index.
//!
//! Every live connection is registered here under its [`ConnectionId`].
//! Channel subscriptions are indexed in both directions so fan-out and
//! disconnect cleanup are both O(1) lookups.
//!
//! # Architecture
//!
//! ```text
//! connections            channel_members          memberships
//! ├── conn-a → handle    ├── #1 → {conn-a, conn-b} ├── conn-a → {#1}
//! ├── conn-b → handle    └── #2 → {conn-b}         └── conn-b → {#1, #2}
//! └── conn-c → handle
//! ```
//!
//! # Thread Safety
//!
//! All three maps live behind one `RwLock`, so removing a connection and
//! dropping its subscriptions is a single atomic step. The lock is never held
//! while a frame is written.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use crate::domain::foundation::ChannelId;

use super::connection::{ConnectionHandle, ConnectionId};
use super::error::RelayError;

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// channel → subscribed connections
    channel_members: HashMap<ChannelId, HashSet<ConnectionId>>,
    /// connection → subscribed channels, for cleanup on removal
    memberships: HashMap<ConnectionId, HashSet<ChannelId>>,
}

impl RegistryInner {
    fn drop_subscriptions(&mut self, id: &ConnectionId) -> usize {
        let Some(channels) = self.memberships.remove(id) else {
            return 0;
        };
        for channel in &channels {
            if let Some(members) = self.channel_members.get_mut(channel) {
                members.remove(id);
                if members.is_empty() {
                    self.channel_members.remove(channel);
                }
            }
        }
        channels.len()
    }
}

/// Concurrency-safe registry of live connections.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// `DuplicateConnection` if the id is already present; the existing
    /// entry is left untouched.
    pub fn add(&self, id: ConnectionId, handle: ConnectionHandle) -> Result<(), RelayError> {
        let mut inner = self.inner.write();
        if inner.connections.contains_key(&id) {
            return Err(RelayError::DuplicateConnection(id));
        }
        inner.connections.insert(id, handle);
        Ok(())
    }

    /// Deregister a connection and drop all of its subscriptions.
    ///
    /// The removed handle is marked closed. Removing an absent id is a no-op.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let (handle, dropped) = {
            let mut inner = self.inner.write();
            let handle = inner.connections.remove(id);
            let dropped = inner.drop_subscriptions(id);
            (handle, dropped)
        };

        if let Some(handle) = &handle {
            handle.mark_closed();
            debug!(connection_id = %id, subscriptions = dropped, "Connection deregistered");
        }
        handle
    }

    pub fn lookup(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.inner.read().connections.get(id).cloned()
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.inner.read().connections.contains_key(id)
    }

    /// Resolve each id and hand its handle to `f`.
    ///
    /// Ids that are not (or no longer) registered are skipped. Each id is
    /// resolved separately and the lock is released before `f` runs, so `f`
    /// may block on I/O or call back into the registry.
    ///
    /// Returns the number of handles visited.
    pub fn for_each<F>(&self, ids: &[ConnectionId], mut f: F) -> usize
    where
        F: FnMut(&ConnectionHandle),
    {
        let mut visited = 0;
        for id in ids {
            let Some(handle) = self.lookup(id) else {
                continue;
            };
            f(&handle);
            visited += 1;
        }
        visited
    }

    /// Subscribe a registered connection to a channel.
    ///
    /// Idempotent. Returns `false` if the connection is not registered.
    pub fn subscribe(&self, id: &ConnectionId, channel_id: ChannelId) -> bool {
        let mut inner = self.inner.write();
        if !inner.connections.contains_key(id) {
            return false;
        }
        inner
            .channel_members
            .entry(channel_id)
            .or_default()
            .insert(id.clone());
        inner
            .memberships
            .entry(id.clone())
            .or_default()
            .insert(channel_id);
        true
    }

    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&self, id: &ConnectionId, channel_id: ChannelId) -> bool {
        let mut inner = self.inner.write();

        let removed = match inner.channel_members.get_mut(&channel_id) {
            Some(members) => {
                let removed = members.remove(id);
                if members.is_empty() {
                    inner.channel_members.remove(&channel_id);
                }
                removed
            }
            None => false,
        };

        if let Some(channels) = inner.memberships.get_mut(id) {
            channels.remove(&channel_id);
            if channels.is_empty() {
                inner.memberships.remove(id);
            }
        }
        removed
    }

    /// Drop every subscription the connection holds, keeping it registered.
    pub fn unsubscribe_all(&self, id: &ConnectionId) -> usize {
        self.inner.write().drop_subscriptions(id)
    }

    pub fn is_subscribed(&self, id: &ConnectionId, channel_id: ChannelId) -> bool {
        self.inner
            .read()
            .channel_members
            .get(&channel_id)
            .is_some_and(|members| members.contains(id))
    }

    /// Snapshot of the connections subscribed to a channel.
    pub fn subscribers(&self, channel_id: ChannelId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .channel_members
            .get(&channel_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels a connection is subscribed to.
    pub fn subscriptions(&self, id: &ConnectionId) -> Vec<ChannelId> {
        let mut channels: Vec<ChannelId> = self
            .inner
            .read()
            .memberships
            .get(id)
            .map(|channels| channels.iter().copied().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.read().connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().connections.is_empty()
    }
}
