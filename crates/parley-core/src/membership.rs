//! Channel membership.
//!
//! Channel-indexed subscriber sets for O(subscribers) fan-out, plus a
//! connection-indexed reverse map so a closing connection can be dropped from
//! every channel it joined without scanning all channels.

use crate::channel::ChannelId;
use crate::connection::{ConnectionId, ConnectionRegistry};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Membership errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MembershipError {
    /// The connection is unknown or tearing down.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The channel cannot be subscribed to explicitly.
    #[error("Channel {0} is reserved")]
    Reserved(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Membership statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipStats {
    /// Channels with at least one subscriber.
    pub channel_count: usize,
    /// Connections with at least one subscription.
    pub connection_count: usize,
    /// Total number of subscriptions.
    pub total_subscriptions: usize,
}

/// Tracks which connections are subscribed to which channels.
///
/// Every subscriber is a live connection of the registry: subscribing
/// validates the connection while holding its reverse-map entry, and
/// [`drop_connection`](Self::drop_connection) takes that same entry, so a
/// subscribe racing a disconnect is either rejected or removed again.
/// Locks are taken reverse-map entry first, then channel entry.
pub struct ChannelMembership {
    registry: Arc<ConnectionRegistry>,
    /// Channel -> subscribed connections.
    channels: DashMap<ChannelId, HashSet<ConnectionId>>,
    /// Connection -> channels it joined.
    joined: DashMap<ConnectionId, HashSet<ChannelId>>,
    max_subscriptions_per_connection: usize,
}

impl ChannelMembership {
    /// Create an empty membership table over a registry.
    #[must_use]
    pub fn new(registry: Arc<ConnectionRegistry>, max_subscriptions_per_connection: usize) -> Self {
        Self {
            registry,
            channels: DashMap::new(),
            joined: DashMap::new(),
            max_subscriptions_per_connection,
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// Returns `true` if the subscription is new; subscribing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not live, the channel is
    /// reserved, or the connection's subscription limit is reached.
    pub fn subscribe(
        &self,
        connection_id: &ConnectionId,
        channel: &ChannelId,
    ) -> Result<bool, MembershipError> {
        if !channel.is_subscribable() {
            return Err(MembershipError::Reserved(channel.to_string()));
        }

        let mut joined = match self.joined.entry(connection_id.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                if !self.registry.is_live(connection_id) {
                    return Err(MembershipError::UnknownConnection(connection_id.clone()));
                }
                entry.insert(HashSet::new())
            }
        };

        // Teardown may have started since this entry was created.
        if !self.registry.is_live(connection_id) {
            return Err(MembershipError::UnknownConnection(connection_id.clone()));
        }
        if joined.contains(channel) {
            return Ok(false);
        }
        if joined.len() >= self.max_subscriptions_per_connection {
            return Err(MembershipError::MaxSubscriptionsReached);
        }

        joined.insert(channel.clone());
        let mut subscribers = self.channels.entry(channel.clone()).or_default();
        subscribers.insert(connection_id.clone());

        debug!(
            channel = %channel,
            connection = %connection_id,
            subscribers = subscribers.len(),
            "Subscribed"
        );
        Ok(true)
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `true` if the connection was subscribed. Unknown connections
    /// and channels are a no-op.
    pub fn unsubscribe(&self, connection_id: &ConnectionId, channel: &ChannelId) -> bool {
        let Some(mut joined) = self.joined.get_mut(connection_id) else {
            return false;
        };
        if !joined.remove(channel) {
            return false;
        }
        self.remove_subscriber(channel, connection_id);
        drop(joined);

        self.joined
            .remove_if(connection_id, |_, channels| channels.is_empty());

        debug!(channel = %channel, connection = %connection_id, "Unsubscribed");
        true
    }

    /// Remove a connection from every channel it joined.
    ///
    /// Returns the number of subscriptions removed.
    pub fn drop_connection(&self, connection_id: &ConnectionId) -> usize {
        let Some((_, channels)) = self.joined.remove(connection_id) else {
            return 0;
        };

        for channel in &channels {
            self.remove_subscriber(channel, connection_id);
        }

        debug!(connection = %connection_id, channels = channels.len(), "Dropped connection from all channels");
        channels.len()
    }

    /// Current subscribers of a channel.
    #[must_use]
    pub fn subscribers_of(&self, channel: &ChannelId) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a connection is subscribed to a channel.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId, channel: &ChannelId) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|set| set.contains(connection_id))
    }

    /// Channels a connection is subscribed to.
    #[must_use]
    pub fn channels_of(&self, connection_id: &ConnectionId) -> Vec<ChannelId> {
        self.joined
            .get(connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every connection that appears in any subscriber set.
    #[must_use]
    pub fn subscribed_connections(&self) -> HashSet<ConnectionId> {
        self.channels
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Membership statistics.
    #[must_use]
    pub fn stats(&self) -> MembershipStats {
        MembershipStats {
            channel_count: self.channels.len(),
            connection_count: self.joined.len(),
            total_subscriptions: self.joined.iter().map(|s| s.len()).sum(),
        }
    }

    fn remove_subscriber(&self, channel: &ChannelId, connection_id: &ConnectionId) {
        if let Entry::Occupied(mut entry) = self.channels.entry(channel.clone()) {
            entry.get_mut().remove(connection_id);
            if entry.get().is_empty() {
                entry.remove();
                debug!(channel = %channel, "Deleted empty channel");
            }
        }
    }
}
