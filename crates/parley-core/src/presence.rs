//! Presence tracking for Parley.
//!
//! A user is online while they hold at least one bound connection. Only the
//! first connect and the last disconnect produce a presence change; extra
//! tabs coming and going are invisible to everyone else.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_protocol::{Event, UserId};
use tracing::debug;

/// Live connection counts per user.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    counts: DashMap<UserId, usize>,
}

impl PresenceTracker {
    /// Create an empty presence tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new bound connection for a user.
    ///
    /// Returns a `PresenceChanged { online: true }` event on the 0 -> 1
    /// transition only.
    pub fn on_connect(&self, user_id: &UserId) -> Option<Event> {
        let mut count = self.counts.entry(user_id.clone()).or_insert(0);
        *count += 1;
        if *count > 1 {
            return None;
        }

        debug!(user = %user_id, "Presence: user online");
        Some(Event::PresenceChanged {
            user_id: user_id.clone(),
            online: true,
        })
    }

    /// Record a closed connection for a user.
    ///
    /// Returns a `PresenceChanged { online: false }` event on the 1 -> 0
    /// transition only. Users with no recorded connections are ignored, so
    /// counts never go negative.
    pub fn on_disconnect(&self, user_id: &UserId) -> Option<Event> {
        let Entry::Occupied(mut entry) = self.counts.entry(user_id.clone()) else {
            return None;
        };

        *entry.get_mut() -= 1;
        if *entry.get() > 0 {
            return None;
        }
        entry.remove();

        debug!(user = %user_id, "Presence: user offline");
        Some(Event::PresenceChanged {
            user_id: user_id.clone(),
            online: false,
        })
    }

    /// Whether the user is online.
    #[must_use]
    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.counts.contains_key(user_id)
    }

    /// Number of live connections recorded for a user.
    #[must_use]
    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.counts.get(user_id).map(|c| *c).unwrap_or(0)
    }

    /// Users currently online, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.counts.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(event: Option<Event>) -> Option<bool> {
        match event {
            Some(Event::PresenceChanged { online, .. }) => Some(online),
            Some(other) => panic!("Unexpected event {:?}", other),
            None => None,
        }
    }

    #[test]
    fn test_presence_debounce() {
        let presence = PresenceTracker::new();
        let alice = UserId::new("alice").unwrap();

        let mut fired = Vec::new();
        for _ in 0..3 {
            fired.extend(online(presence.on_connect(&alice)));
        }
        assert_eq!(fired, vec![true]);
        assert_eq!(presence.connection_count(&alice), 3);

        fired.clear();
        for _ in 0..3 {
            fired.extend(online(presence.on_disconnect(&alice)));
        }
        assert_eq!(fired, vec![false]);
        assert!(!presence.is_online(&alice));
    }

    #[test]
    fn test_disconnect_unknown_user() {
        let presence = PresenceTracker::new();
        let bob = UserId::new("bob").unwrap();

        assert!(presence.on_disconnect(&bob).is_none());
        assert_eq!(presence.connection_count(&bob), 0);

        // A stray disconnect does not swallow the next online transition
        assert_eq!(online(presence.on_connect(&bob)), Some(true));
    }

    #[test]
    fn test_online_users_sorted() {
        let presence = PresenceTracker::new();
        for name in ["carol", "alice", "bob"] {
            presence.on_connect(&UserId::new(name).unwrap());
        }

        let names: Vec<String> = presence
            .online_users()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }
}
