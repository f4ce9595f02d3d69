//! Connection registry.
//!
//! Maps live transport connections to the users they belong to. A user may
//! hold several connections at once (tabs, devices).

use crate::clock::{now_millis, now_nanos};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{Frame, UserId};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Sending half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<Arc<Frame>>;

/// Receiving half of a connection's outbound queue, drained by the transport.
pub type OutboundReceiver = mpsc::Receiver<Arc<Frame>>;

/// Create a bounded outbound queue for one connection.
#[must_use]
pub fn outbound_channel(capacity: usize) -> (Outbound, OutboundReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Atomic counter so IDs stay unique within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh connection ID.
    #[must_use]
    pub fn generate() -> Self {
        let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", now_nanos(), counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A registered transport connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Connection ID.
    pub id: ConnectionId,
    /// Bound user, `None` until authentication succeeds.
    pub user_id: Option<UserId>,
    /// When the transport connected (ms).
    pub connected_at: u64,
    /// Set once teardown has started; the connection no longer accepts
    /// subscriptions or deliveries.
    closing: bool,
    outbound: Outbound,
}

impl Connection {
    /// Whether teardown has started.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

/// Outcome of binding a connection to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// The user's first live connection.
    FirstConnection,
    /// The user already had other live connections.
    AdditionalConnection,
    /// The connection was already bound to this user.
    AlreadyBound,
    /// The connection is bound to a different user.
    Conflict,
    /// No such live connection.
    NotFound,
}

impl Binding {
    /// Whether this call created a new binding.
    #[must_use]
    pub fn is_new(self) -> bool {
        matches!(self, Binding::FirstConnection | Binding::AdditionalConnection)
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Open connections, bound or not.
    pub connection_count: usize,
    /// Users with at least one bound connection.
    pub user_count: usize,
}

/// Maps connections to users.
///
/// Both indices are sharded maps, so unrelated users never contend. Locks are
/// always taken connection entry first, then user entry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly connected transport. The connection is unbound until
    /// [`register`](Self::register) is called.
    pub fn open(&self, outbound: Outbound) -> ConnectionId {
        let id = ConnectionId::generate();
        self.connections.insert(
            id.clone(),
            Connection {
                id: id.clone(),
                user_id: None,
                connected_at: now_millis(),
                closing: false,
                outbound,
            },
        );
        debug!(connection = %id, "Connection opened");
        id
    }

    /// Bind a connection to an authenticated user. Idempotent per connection.
    pub fn register(&self, id: &ConnectionId, user_id: &UserId) -> Binding {
        let Some(mut conn) = self.connections.get_mut(id) else {
            return Binding::NotFound;
        };
        if conn.closing {
            return Binding::NotFound;
        }
        match &conn.user_id {
            Some(bound) if bound == user_id => return Binding::AlreadyBound,
            Some(_) => return Binding::Conflict,
            None => {}
        }

        conn.user_id = Some(user_id.clone());
        let mut set = self.users.entry(user_id.clone()).or_default();
        set.insert(id.clone());
        let binding = if set.len() == 1 {
            Binding::FirstConnection
        } else {
            Binding::AdditionalConnection
        };

        debug!(connection = %id, user = %user_id, connections = set.len(), "Connection registered");
        binding
    }

    /// Start teardown: the connection stops accepting subscriptions and
    /// deliveries but stays registered until [`unregister`](Self::unregister).
    ///
    /// Returns `false` for unknown connections.
    pub fn mark_closing(&self, id: &ConnectionId) -> bool {
        match self.connections.get_mut(id) {
            Some(mut conn) => {
                conn.closing = true;
                true
            }
            None => false,
        }
    }

    /// Remove a connection.
    ///
    /// Returns the user it was bound to, or `None` if the connection was
    /// unknown (e.g. a second close) or never bound.
    pub fn unregister(&self, id: &ConnectionId) -> Option<UserId> {
        let (_, conn) = self.connections.remove(id)?;
        let user_id = conn.user_id?;

        if let Entry::Occupied(mut entry) = self.users.entry(user_id.clone()) {
            entry.get_mut().remove(id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }

        debug!(connection = %id, user = %user_id, "Connection unregistered");
        Some(user_id)
    }

    /// Get a snapshot of a connection.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.get(id).map(|c| c.clone())
    }

    /// Whether the connection exists and is not tearing down.
    #[must_use]
    pub fn is_live(&self, id: &ConnectionId) -> bool {
        self.connections.get(id).is_some_and(|c| !c.closing)
    }

    /// User bound to a connection.
    #[must_use]
    pub fn user_of(&self, id: &ConnectionId) -> Option<UserId> {
        self.connections.get(id).and_then(|c| c.user_id.clone())
    }

    /// Outbound queue of a live connection.
    #[must_use]
    pub fn outbound(&self, id: &ConnectionId) -> Option<Outbound> {
        self.connections
            .get(id)
            .filter(|c| !c.closing)
            .map(|c| c.outbound.clone())
    }

    /// All live, bound connections with their outbound queues.
    #[must_use]
    pub fn live_connections(&self) -> Vec<(ConnectionId, Outbound)> {
        self.connections
            .iter()
            .filter(|c| !c.closing && c.user_id.is_some())
            .map(|c| (c.id.clone(), c.outbound.clone()))
            .collect()
    }

    /// Connections bound to a user.
    #[must_use]
    pub fn connections_for(&self, user_id: &UserId) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether the user has at least one bound connection.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connection_count: self.connections.len(),
            user_count: self.users.len(),
        }
    }
}
