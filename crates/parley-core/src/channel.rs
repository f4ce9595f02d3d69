//! Channel addressing for Parley.
//!
//! Channels are logical broadcast groups. Connections subscribe to them and
//! the router fans events out to every subscriber.

use parley_protocol::{GroupId, UserId};
use std::fmt;

/// A channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    /// Per-user inbox, carries direct messages and typing indicators.
    Inbox(UserId),
    /// Per-group room, joined while a group chat view is open.
    GroupRoom(GroupId),
    /// Per-user chat list (sidebar) update stream.
    ChatList(UserId),
    /// Every live connection. Resolved from the registry, never subscribed.
    Everyone,
}

impl ChannelId {
    /// Whether connections may subscribe to this channel explicitly.
    #[must_use]
    pub fn is_subscribable(&self) -> bool {
        !matches!(self, ChannelId::Everyone)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Inbox(user) => write!(f, "user:{user}"),
            ChannelId::GroupRoom(group) => write!(f, "group:{group}"),
            ChannelId::ChatList(user) => write!(f, "chatlist:{user}"),
            ChannelId::Everyone => f.write_str("everyone"),
        }
    }
}
