//! Event router for Parley.
//!
//! Resolves the channels an [`Event`] targets and pushes it to every live
//! subscriber. Delivery is at-most-once and best-effort: each subscriber gets
//! one non-blocking enqueue, and a full or closed queue only loses that one
//! delivery.

use crate::channel::ChannelId;
use crate::connection::{ConnectionId, ConnectionRegistry, Outbound};
use crate::membership::ChannelMembership;
use crate::store::ChatStore;
use parley_protocol::{Event, Frame, MessageTarget, UserId};
use std::collections::HashSet;
use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

/// Delivery counters for one or more routed events. Observability only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Channels resolved.
    pub channels: usize,
    /// Distinct connections a delivery was attempted to.
    pub attempted: usize,
    /// Deliveries enqueued.
    pub delivered: usize,
    /// Deliveries lost to a full, closed or vanished connection.
    pub dropped: usize,
}

impl AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.channels += other.channels;
        self.attempted += other.attempted;
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

/// Target channels of an event, in delivery priority order.
///
/// Pure: `members` is the current member list of the group a group message
/// was sent to and is ignored for every other event.
#[must_use]
pub fn targets(event: &Event, members: &[UserId]) -> Vec<ChannelId> {
    match event {
        Event::MessageSent {
            sender_id,
            target: MessageTarget::Direct { receiver_id },
            ..
        } => vec![
            ChannelId::Inbox(receiver_id.clone()),
            ChannelId::Inbox(sender_id.clone()),
            ChannelId::ChatList(receiver_id.clone()),
            ChannelId::ChatList(sender_id.clone()),
        ],
        Event::MessageSent {
            target: MessageTarget::Group { group_id },
            ..
        } => std::iter::once(ChannelId::GroupRoom(*group_id))
            .chain(members.iter().cloned().map(ChannelId::ChatList))
            .collect(),
        Event::ProfileUpdated { .. } | Event::PresenceChanged { .. } => vec![ChannelId::Everyone],
        Event::GroupUpdated { group_id, .. } => vec![ChannelId::GroupRoom(*group_id)],
        Event::MembershipChanged {
            group_id,
            user_id,
            added: true,
        } => vec![
            ChannelId::GroupRoom(*group_id),
            ChannelId::ChatList(user_id.clone()),
        ],
        Event::MembershipChanged {
            group_id,
            added: false,
            ..
        } => vec![ChannelId::GroupRoom(*group_id)],
        Event::ReadReceipt { user_id, .. } | Event::ChatListRefreshed { user_id, .. } => {
            vec![ChannelId::ChatList(user_id.clone())]
        }
        Event::Typing { receiver_id, .. } => vec![ChannelId::Inbox(receiver_id.clone())],
    }
}

/// The fan-out engine.
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<ChannelMembership>,
    store: Arc<dyn ChatStore>,
}

impl EventRouter {
    /// Create a router.
    #[must_use]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        membership: Arc<ChannelMembership>,
        store: Arc<dyn ChatStore>,
    ) -> Self {
        Self {
            registry,
            membership,
            store,
        }
    }

    /// Resolve target channels, looking up group members where needed.
    ///
    /// Returns `None` when the member lookup fails; the event then has no
    /// targets.
    pub async fn resolve(&self, event: &Event) -> Option<Vec<ChannelId>> {
        let members = match event {
            Event::MessageSent {
                target: MessageTarget::Group { group_id },
                ..
            } => match self.store.list_members(group_id).await {
                Ok(members) => members,
                Err(e) => {
                    warn!(group = %group_id, error = %e, event = event.name(), "Member lookup failed, no targets resolved");
                    return None;
                }
            },
            _ => Vec::new(),
        };
        Some(targets(event, &members))
    }

    /// Route an event to every live subscriber of its target channels.
    pub async fn route(&self, event: Event) -> DeliveryReport {
        match self.resolve(&event).await {
            Some(channels) => self.deliver(&channels, event),
            None => DeliveryReport::default(),
        }
    }

    /// Route an event whose group members were already looked up.
    pub fn route_to_members(&self, event: Event, members: &[UserId]) -> DeliveryReport {
        let channels = targets(&event, members);
        self.deliver(&channels, event)
    }

    /// Deliver an event to the subscribers of the given channels.
    ///
    /// A connection subscribed to several of the channels receives the event
    /// once, tagged with the first matching channel.
    pub fn deliver(&self, channels: &[ChannelId], event: Event) -> DeliveryReport {
        let mut report = DeliveryReport {
            channels: channels.len(),
            ..DeliveryReport::default()
        };
        let mut seen: HashSet<ConnectionId> = HashSet::new();

        for channel in channels {
            let recipients: Vec<(ConnectionId, Option<Outbound>)> = match channel {
                ChannelId::Everyone => self
                    .registry
                    .live_connections()
                    .into_iter()
                    .map(|(id, tx)| (id, Some(tx)))
                    .collect(),
                _ => self
                    .membership
                    .subscribers_of(channel)
                    .into_iter()
                    .map(|id| {
                        let tx = self.registry.outbound(&id);
                        (id, tx)
                    })
                    .collect(),
            };

            let mut frame: Option<Arc<Frame>> = None;
            for (connection_id, outbound) in recipients {
                if !seen.insert(connection_id.clone()) {
                    continue;
                }
                report.attempted += 1;

                let Some(outbound) = outbound else {
                    debug!(connection = %connection_id, channel = %channel, "Connection gone, delivery dropped");
                    report.dropped += 1;
                    continue;
                };

                let frame = frame
                    .get_or_insert_with(|| Arc::new(Frame::event(channel.to_string(), event.clone())))
                    .clone();

                match outbound.try_send(frame) {
                    Ok(()) => {
                        trace!(connection = %connection_id, channel = %channel, "Delivered");
                        report.delivered += 1;
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(connection = %connection_id, channel = %channel, event = event.name(), "Outbound queue full, delivery dropped");
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(connection = %connection_id, channel = %channel, "Outbound queue closed, delivery dropped");
                        report.dropped += 1;
                    }
                }
            }
        }

        debug!(
            event = event.name(),
            channels = report.channels,
            attempted = report.attempted,
            delivered = report.delivered,
            dropped = report.dropped,
            "Routed event"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::outbound_channel;
    use crate::memory::MemoryStore;
    use parley_protocol::{ChatKey, GroupFields, GroupId, MessagePayload, ProfileFields};

    fn user(name: &str) -> UserId {
        UserId::new(name).unwrap()
    }

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        membership: Arc<ChannelMembership>,
        store: Arc<MemoryStore>,
        router: EventRouter,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(ChannelMembership::new(registry.clone(), 100));
        let store = Arc::new(MemoryStore::new());
        let router = EventRouter::new(registry.clone(), membership.clone(), store.clone());
        Fixture {
            registry,
            membership,
            store,
            router,
        }
    }

    fn connect(
        fx: &Fixture,
        name: &str,
        capacity: usize,
    ) -> (ConnectionId, crate::connection::OutboundReceiver) {
        let (tx, rx) = outbound_channel(capacity);
        let id = fx.registry.open(tx);
        fx.registry.register(&id, &user(name));
        (id, rx)
    }

    fn direct(from: &str, to: &str) -> Event {
        Event::MessageSent {
            message_id: 1,
            sender_id: user(from),
            target: MessageTarget::Direct {
                receiver_id: user(to),
            },
            payload: MessagePayload::text("hi"),
            sent_at: 10,
        }
    }

    #[test]
    fn test_targets_direct_message() {
        let channels = targets(&direct("u1", "u2"), &[]);
        assert_eq!(
            channels,
            vec![
                ChannelId::Inbox(user("u2")),
                ChannelId::Inbox(user("u1")),
                ChannelId::ChatList(user("u2")),
                ChannelId::ChatList(user("u1")),
            ]
        );
    }

    #[test]
    fn test_targets_table() {
        let g = GroupId::new(5);
        let group_message = Event::MessageSent {
            message_id: 2,
            sender_id: user("a"),
            target: MessageTarget::Group { group_id: g },
            payload: MessagePayload::text("yo"),
            sent_at: 1,
        };
        assert_eq!(
            targets(&group_message, &[user("a"), user("b")]),
            vec![
                ChannelId::GroupRoom(g),
                ChannelId::ChatList(user("a")),
                ChannelId::ChatList(user("b")),
            ]
        );

        let removed = Event::MembershipChanged {
            group_id: g,
            user_id: user("b"),
            added: false,
        };
        assert_eq!(targets(&removed, &[]), vec![ChannelId::GroupRoom(g)]);

        let added = Event::MembershipChanged {
            group_id: g,
            user_id: user("c"),
            added: true,
        };
        assert_eq!(
            targets(&added, &[]),
            vec![ChannelId::GroupRoom(g), ChannelId::ChatList(user("c"))]
        );

        let updated = Event::GroupUpdated {
            group_id: g,
            fields: GroupFields::default(),
        };
        assert_eq!(targets(&updated, &[]), vec![ChannelId::GroupRoom(g)]);

        let receipt = Event::ReadReceipt {
            user_id: user("a"),
            chat: ChatKey::Group(g),
        };
        assert_eq!(targets(&receipt, &[]), vec![ChannelId::ChatList(user("a"))]);

        let presence = Event::PresenceChanged {
            user_id: user("a"),
            online: true,
        };
        assert_eq!(targets(&presence, &[]), vec![ChannelId::Everyone]);

        let profile = Event::ProfileUpdated {
            user_id: user("a"),
            fields: ProfileFields {
                display_name: Some("Ada".into()),
                ..ProfileFields::default()
            },
        };
        assert_eq!(targets(&profile, &[user("b")]), vec![ChannelId::Everyone]);
    }

    #[tokio::test]
    async fn test_delivery_skips_closed_subscriber() {
        let fx = fixture();
        let channel = ChannelId::Inbox(user("u2"));

        let (a, mut rx_a) = connect(&fx, "u2", 8);
        let (b, mut rx_b) = connect(&fx, "u2", 8);
        let (c, rx_c) = connect(&fx, "u2", 8);
        for id in [&a, &b, &c] {
            fx.membership.subscribe(id, &channel).unwrap();
        }
        drop(rx_c);

        let report = fx.router.deliver(&[channel], direct("u1", "u2"));
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, 1);

        assert!(matches!(&*rx_a.try_recv().unwrap(), Frame::Event { channel, .. } if channel == "user:u2"));
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let fx = fixture();
        let channel = ChannelId::Inbox(user("u2"));

        let (slow, _rx_slow) = connect(&fx, "u2", 1);
        let (fast, mut rx_fast) = connect(&fx, "u2", 8);
        fx.membership.subscribe(&slow, &channel).unwrap();
        fx.membership.subscribe(&fast, &channel).unwrap();

        let first = fx.router.deliver(&[channel.clone()], direct("u1", "u2"));
        assert_eq!(first.delivered, 2);

        let second = fx.router.deliver(&[channel], direct("u1", "u2"));
        assert_eq!(second.delivered, 1);
        assert_eq!(second.dropped, 1);
        assert!(rx_fast.try_recv().is_ok());
        assert!(rx_fast.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_connection_receives_event_once() {
        let fx = fixture();
        let (a, mut rx) = connect(&fx, "u1", 8);
        fx.membership.subscribe(&a, &ChannelId::Inbox(user("u1"))).unwrap();
        fx.membership.subscribe(&a, &ChannelId::ChatList(user("u1"))).unwrap();

        let report = fx.router.route(direct("u1", "u2")).await;
        assert_eq!(report.channels, 4);
        assert_eq!(report.delivered, 1);

        assert!(matches!(&*rx.try_recv().unwrap(), Frame::Event { channel, .. } if channel == "user:u1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_everyone_reaches_all_live_connections() {
        let fx = fixture();
        let (_a, mut rx_a) = connect(&fx, "u1", 8);
        let (b, mut rx_b) = connect(&fx, "u2", 8);
        fx.registry.mark_closing(&b);

        let report = fx
            .router
            .route(Event::PresenceChanged {
                user_id: user("u3"),
                online: true,
            })
            .await;
        assert_eq!(report.delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_message_without_group_resolves_nothing() {
        let fx = fixture();
        let (a, mut rx) = connect(&fx, "u1", 8);
        fx.membership
            .subscribe(&a, &ChannelId::GroupRoom(GroupId::new(404)))
            .unwrap();

        let report = fx
            .router
            .route(Event::MessageSent {
                message_id: 1,
                sender_id: user("u1"),
                target: MessageTarget::Group {
                    group_id: GroupId::new(404),
                },
                payload: MessagePayload::text("lost"),
                sent_at: 1,
            })
            .await;

        assert_eq!(report, DeliveryReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_group_message_reaches_member_chat_lists() {
        let fx = fixture();
        let group = fx
            .store
            .create_group(&user("u1"), "Team", &[user("u2")])
            .await
            .unwrap();

        let (a, mut rx_a) = connect(&fx, "u1", 8);
        let (b, mut rx_b) = connect(&fx, "u2", 8);
        fx.membership.subscribe(&a, &ChannelId::GroupRoom(group)).unwrap();
        fx.membership.subscribe(&b, &ChannelId::ChatList(user("u2"))).unwrap();

        let report = fx
            .router
            .route(Event::MessageSent {
                message_id: 1,
                sender_id: user("u1"),
                target: MessageTarget::Group { group_id: group },
                payload: MessagePayload::text("hello team"),
                sent_at: 1,
            })
            .await;

        assert_eq!(report.delivered, 2);
        assert!(matches!(&*rx_a.try_recv().unwrap(), Frame::Event { channel, .. } if channel.starts_with("group:")));
        assert!(matches!(&*rx_b.try_recv().unwrap(), Frame::Event { channel, .. } if channel == "chatlist:u2"));
    }
}
