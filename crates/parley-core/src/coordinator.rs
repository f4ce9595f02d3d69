//! Session coordinator.
//!
//! Glues transport lifecycle and inbound actions to the core. Every mutating
//! action runs the same fixed sequence: persist, route the primary event,
//! then refresh the chat lists of every affected user. A failed persist
//! stops the sequence before anything is routed.

use crate::channel::ChannelId;
use crate::clock::now_millis;
use crate::connection::{ConnectionId, ConnectionRegistry, Outbound};
use crate::membership::{ChannelMembership, MembershipError};
use crate::presence::PresenceTracker;
use crate::router::{DeliveryReport, EventRouter};
use crate::store::{ChatStore, NewMessage, StoreError};
use crate::unread::UnreadReconciler;
use dashmap::DashMap;
use parley_protocol::{
    codes, ChatKey, Event, GroupFields, GroupId, MessagePayload, MessageTarget, ProfileFields,
    StoredMessage, UnreadSnapshot, UserId,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// History page size when the client does not ask for one.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Largest history page served.
pub const MAX_HISTORY_LIMIT: usize = 200;

/// Session coordinator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum channels a single connection may join.
    pub max_subscriptions_per_connection: usize,
    /// Push a fresh chat list to the user when a connection opens.
    pub refresh_on_connect: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_subscriptions_per_connection: 100,
            refresh_on_connect: true,
        }
    }
}

/// Errors surfaced to the caller of an action.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The store rejected or failed the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A subscription could not be made.
    #[error(transparent)]
    Membership(#[from] MembershipError),

    /// The request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The user is not a member of the group.
    #[error("Not a member of group {0}")]
    NotMember(GroupId),

    /// The connection is unknown or unbound.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

impl SessionError {
    /// Protocol error code for this error.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            SessionError::Store(StoreError::NotFound(_)) => codes::NOT_FOUND,
            SessionError::Store(StoreError::Forbidden(_)) => codes::FORBIDDEN,
            SessionError::Store(StoreError::Invalid(_)) => codes::INVALID_REQUEST,
            SessionError::Store(StoreError::Unavailable(_)) => codes::PERSISTENCE_FAILURE,
            SessionError::Membership(MembershipError::UnknownConnection(_))
            | SessionError::UnknownConnection(_) => codes::UNKNOWN_CONNECTION,
            SessionError::Membership(_) => codes::SUBSCRIBE_FAILED,
            SessionError::InvalidRequest(_) => codes::INVALID_REQUEST,
            SessionError::NotMember(_) => codes::FORBIDDEN,
        }
    }
}

/// Outcome of a mutating action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionReport {
    /// Identifier created by the action (message or group), if any.
    pub created_id: Option<u64>,
    /// Deliveries made for the primary event and the chat list refreshes.
    pub deliveries: DeliveryReport,
}

/// Orchestrates connections and actions over the core components.
pub struct SessionCoordinator {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<ChannelMembership>,
    presence: PresenceTracker,
    router: Arc<EventRouter>,
    reconciler: UnreadReconciler,
    store: Arc<dyn ChatStore>,
    config: SessionConfig,
    /// Serializes group room joins against membership changes of the group.
    room_locks: DashMap<GroupId, Arc<Mutex<()>>>,
}

impl SessionCoordinator {
    /// Wire up a coordinator over a store.
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, config: SessionConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(ChannelMembership::new(
            registry.clone(),
            config.max_subscriptions_per_connection,
        ));
        let router = Arc::new(EventRouter::new(
            registry.clone(),
            membership.clone(),
            store.clone(),
        ));
        let reconciler = UnreadReconciler::new(store.clone(), router.clone());

        Self {
            registry,
            membership,
            presence: PresenceTracker::new(),
            router,
            reconciler,
            store,
            config,
            room_locks: DashMap::new(),
        }
    }

    /// Connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Channel membership.
    #[must_use]
    pub fn membership(&self) -> &ChannelMembership {
        &self.membership
    }

    /// Presence tracker.
    #[must_use]
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Register an authenticated transport connection.
    ///
    /// Binds it to the user, subscribes it to the user's inbox and chat list,
    /// announces presence on the user's first connection and pushes the
    /// initial chat list.
    ///
    /// # Errors
    ///
    /// Returns an error if the implicit subscriptions cannot be made; the
    /// connection is torn down again in that case.
    pub async fn connect(
        &self,
        user_id: UserId,
        outbound: Outbound,
    ) -> Result<ConnectionId, SessionError> {
        let connection_id = self.registry.open(outbound);
        self.registry.register(&connection_id, &user_id);

        for channel in [
            ChannelId::Inbox(user_id.clone()),
            ChannelId::ChatList(user_id.clone()),
        ] {
            if let Err(e) = self.membership.subscribe(&connection_id, &channel) {
                self.registry.mark_closing(&connection_id);
                self.membership.drop_connection(&connection_id);
                self.registry.unregister(&connection_id);
                return Err(e.into());
            }
        }

        if let Some(event) = self.presence.on_connect(&user_id) {
            self.router.route(event).await;
        }
        if self.config.refresh_on_connect {
            self.reconciler.refresh(std::slice::from_ref(&user_id)).await;
        }

        info!(connection = %connection_id, user = %user_id, "Session connected");
        Ok(connection_id)
    }

    /// Tear down a connection.
    ///
    /// Subscriptions are dropped before the registry entry goes away, and
    /// presence goes offline with the user's last connection. Returns
    /// `false` if the connection was already gone.
    pub async fn disconnect(&self, connection_id: &ConnectionId) -> bool {
        if !self.registry.mark_closing(connection_id) {
            return false;
        }
        let dropped = self.membership.drop_connection(connection_id);
        let user_id = self.registry.unregister(connection_id);

        if let Some(user_id) = &user_id {
            if let Some(event) = self.presence.on_disconnect(user_id) {
                self.router.route(event).await;
            }
        }

        info!(
            connection = %connection_id,
            user = ?user_id.as_ref().map(UserId::as_str),
            subscriptions = dropped,
            "Session disconnected"
        );
        true
    }

    /// User bound to a connection.
    #[must_use]
    pub fn user_of(&self, connection_id: &ConnectionId) -> Option<UserId> {
        self.registry.user_of(connection_id)
    }

    fn room_lock(&self, group_id: GroupId) -> Arc<Mutex<()>> {
        self.room_locks.entry(group_id).or_default().clone()
    }

    fn bound_user(&self, connection_id: &ConnectionId) -> Result<UserId, SessionError> {
        self.registry
            .user_of(connection_id)
            .ok_or_else(|| SessionError::UnknownConnection(connection_id.clone()))
    }

    /// Join a group room. Only current members may join.
    ///
    /// The membership check and the subscription happen under the group's
    /// room lock, so a concurrent removal cannot be undone by a join that
    /// checked membership before it. Returns `true` if the subscription is
    /// new.
    ///
    /// # Errors
    ///
    /// Fails for unknown connections, non-members, failed member lookups and
    /// subscription limits.
    pub async fn subscribe_to_group_room(
        &self,
        connection_id: &ConnectionId,
        group_id: GroupId,
    ) -> Result<bool, SessionError> {
        let user_id = self.bound_user(connection_id)?;
        let lock = self.room_lock(group_id);
        let _guard = lock.lock().await;

        let members = self.store.list_members(&group_id).await?;
        if !members.contains(&user_id) {
            return Err(SessionError::NotMember(group_id));
        }
        Ok(self
            .membership
            .subscribe(connection_id, &ChannelId::GroupRoom(group_id))?)
    }

    /// Leave a group room. Returns `true` if the connection was in it.
    pub fn unsubscribe_from_group_room(&self, connection_id: &ConnectionId, group_id: GroupId) -> bool {
        self.membership
            .unsubscribe(connection_id, &ChannelId::GroupRoom(group_id))
    }

    /// Send a direct message.
    ///
    /// # Errors
    ///
    /// Fails if the payload is empty or the message cannot be persisted.
    pub async fn send_direct_message(
        &self,
        sender_id: &UserId,
        receiver_id: UserId,
        payload: MessagePayload,
    ) -> Result<ActionReport, SessionError> {
        let target = MessageTarget::Direct {
            receiver_id: receiver_id.clone(),
        };
        let (message_id, event) = self.persist_message(sender_id, target, payload).await?;
        let mut deliveries = self.router.route(event).await;
        deliveries += self
            .reconciler
            .refresh(&[sender_id.clone(), receiver_id])
            .await;

        Ok(ActionReport {
            created_id: Some(message_id),
            deliveries,
        })
    }

    /// Send a message to a group the sender belongs to.
    ///
    /// # Errors
    ///
    /// Fails if the payload is empty or the message cannot be persisted.
    pub async fn send_group_message(
        &self,
        sender_id: &UserId,
        group_id: GroupId,
        payload: MessagePayload,
    ) -> Result<ActionReport, SessionError> {
        let target = MessageTarget::Group { group_id };
        let (message_id, event) = self.persist_message(sender_id, target, payload).await?;

        // One member lookup feeds both the routing and the refresh
        let (mut deliveries, affected) = match self.store.list_members(&group_id).await {
            Ok(members) => (self.router.route_to_members(event, &members), members),
            Err(e) => {
                warn!(group = %group_id, error = %e, "Member lookup failed, message not routed");
                (DeliveryReport::default(), vec![sender_id.clone()])
            }
        };
        deliveries += self.reconciler.refresh(&affected).await;

        Ok(ActionReport {
            created_id: Some(message_id),
            deliveries,
        })
    }

    /// Store a message and build the event announcing it.
    async fn persist_message(
        &self,
        sender_id: &UserId,
        target: MessageTarget,
        payload: MessagePayload,
    ) -> Result<(u64, Event), SessionError> {
        if payload.is_empty() {
            return Err(SessionError::InvalidRequest(
                "message has no text or attachment".to_string(),
            ));
        }

        let sent_at = now_millis();
        let message_id = self
            .store
            .insert_message(NewMessage {
                sender_id: sender_id.clone(),
                target: target.clone(),
                payload: payload.clone(),
                sent_at,
            })
            .await?;
        debug!(message = message_id, sender = %sender_id, "Message persisted");

        let event = Event::MessageSent {
            message_id,
            sender_id: sender_id.clone(),
            target,
            payload,
            sent_at,
        };
        Ok((message_id, event))
    }

    /// Mark a chat read and push the user a canonical chat list, whether or
    /// not anything was unread.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the read.
    pub async fn mark_chat_read(
        &self,
        user_id: &UserId,
        chat: ChatKey,
    ) -> Result<ActionReport, SessionError> {
        self.store.mark_read(user_id, &chat).await?;

        let mut deliveries = self
            .router
            .route(Event::ReadReceipt {
                user_id: user_id.clone(),
                chat,
            })
            .await;
        deliveries += self.reconciler.refresh(std::slice::from_ref(user_id)).await;

        Ok(ActionReport {
            created_id: None,
            deliveries,
        })
    }

    /// Update the user's profile and announce it to everyone online.
    ///
    /// # Errors
    ///
    /// Fails if the update is empty or cannot be persisted.
    pub async fn update_profile(
        &self,
        user_id: &UserId,
        fields: ProfileFields,
    ) -> Result<ActionReport, SessionError> {
        if fields.is_empty() {
            return Err(SessionError::InvalidRequest(
                "profile update changes nothing".to_string(),
            ));
        }
        self.store.update_profile(user_id, &fields).await?;

        let deliveries = self
            .router
            .route(Event::ProfileUpdated {
                user_id: user_id.clone(),
                fields,
            })
            .await;
        Ok(ActionReport {
            created_id: None,
            deliveries,
        })
    }

    /// Update a group and refresh its members' chat lists.
    ///
    /// # Errors
    ///
    /// Fails if the update is empty or the store rejects it.
    pub async fn update_group(
        &self,
        actor: &UserId,
        group_id: GroupId,
        fields: GroupFields,
    ) -> Result<ActionReport, SessionError> {
        if fields.is_empty() {
            return Err(SessionError::InvalidRequest(
                "group update changes nothing".to_string(),
            ));
        }
        self.store.update_group(actor, &group_id, &fields).await?;

        let mut deliveries = self
            .router
            .route(Event::GroupUpdated { group_id, fields })
            .await;
        let members = self.members_or(group_id, [actor.clone()]).await;
        deliveries += self.reconciler.refresh(&members).await;

        Ok(ActionReport {
            created_id: None,
            deliveries,
        })
    }

    /// Create a group and make it appear in every member's chat list.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the group.
    pub async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        members: Vec<UserId>,
    ) -> Result<ActionReport, SessionError> {
        let group_id = self.store.create_group(creator, name, &members).await?;
        info!(group = %group_id, creator = %creator, "Group created");

        let mut affected = members;
        affected.push(creator.clone());
        let deliveries = self.reconciler.refresh(&affected).await;

        Ok(ActionReport {
            created_id: Some(group_id.0),
            deliveries,
        })
    }

    /// Add a member to a group.
    ///
    /// The new member's live connections join the group room before the
    /// change is announced, so they see it too.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the change.
    pub async fn add_member(
        &self,
        actor: &UserId,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<ActionReport, SessionError> {
        {
            let lock = self.room_lock(group_id);
            let _guard = lock.lock().await;

            if !self.store.add_member(actor, &group_id, &user_id).await? {
                debug!(group = %group_id, user = %user_id, "Already a member");
                return Ok(ActionReport::default());
            }

            let room = ChannelId::GroupRoom(group_id);
            for connection_id in self.registry.connections_for(&user_id) {
                if let Err(e) = self.membership.subscribe(&connection_id, &room) {
                    warn!(connection = %connection_id, channel = %room, error = %e, "Could not join new member to room");
                }
            }
        }

        let mut deliveries = self
            .router
            .route(Event::MembershipChanged {
                group_id,
                user_id: user_id.clone(),
                added: true,
            })
            .await;
        let members = self.members_or(group_id, [actor.clone(), user_id]).await;
        deliveries += self.reconciler.refresh(&members).await;

        Ok(ActionReport {
            created_id: None,
            deliveries,
        })
    }

    /// Remove a member from a group.
    ///
    /// The removed member's connections leave the group room before the
    /// change is announced, so later room events no longer reach them. Runs
    /// under the group's room lock, like room joins.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the change.
    pub async fn remove_member(
        &self,
        actor: &UserId,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<ActionReport, SessionError> {
        {
            let lock = self.room_lock(group_id);
            let _guard = lock.lock().await;

            self.store.remove_member(actor, &group_id, &user_id).await?;

            let room = ChannelId::GroupRoom(group_id);
            for connection_id in self.registry.connections_for(&user_id) {
                self.membership.unsubscribe(&connection_id, &room);
            }
        }

        let mut deliveries = self
            .router
            .route(Event::MembershipChanged {
                group_id,
                user_id: user_id.clone(),
                added: false,
            })
            .await;
        let mut affected = self.members_or(group_id, [actor.clone()]).await;
        affected.push(user_id);
        deliveries += self.reconciler.refresh(&affected).await;

        Ok(ActionReport {
            created_id: None,
            deliveries,
        })
    }

    /// Relay a typing indicator to the receiver's inbox. Not persisted.
    pub async fn typing(&self, user_id: &UserId, receiver_id: UserId, typing: bool) -> DeliveryReport {
        self.router
            .route(Event::Typing {
                user_id: user_id.clone(),
                receiver_id,
                typing,
            })
            .await
    }

    /// Recompute the user's chat list, push it to all their connections and
    /// return it.
    ///
    /// # Errors
    ///
    /// Fails if the unread summary cannot be read.
    pub async fn refresh_chat_list(&self, user_id: &UserId) -> Result<UnreadSnapshot, SessionError> {
        let (snapshot, _) = self.reconciler.refresh_user(user_id).await?;
        Ok(snapshot)
    }

    /// Recent messages of a chat, oldest first.
    ///
    /// # Errors
    ///
    /// Fails if the store rejects the query, e.g. for a group the user is
    /// not in.
    pub async fn history(
        &self,
        user_id: &UserId,
        chat: &ChatKey,
        limit: Option<usize>,
    ) -> Result<Vec<StoredMessage>, SessionError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.list_messages(user_id, chat, limit).await?)
    }

    /// Users currently online, sorted.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.online_users()
    }

    /// Current members of a group, or `fallback` if the lookup fails.
    async fn members_or<const N: usize>(&self, group_id: GroupId, fallback: [UserId; N]) -> Vec<UserId> {
        match self.store.list_members(&group_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!(group = %group_id, error = %e, "Member lookup failed, refreshing actors only");
                fallback.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{outbound_channel, OutboundReceiver};
    use crate::testing::{drain_events, user, SpyStore};
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn coordinator(store: Arc<SpyStore>) -> SessionCoordinator {
        SessionCoordinator::new(store, SessionConfig::default())
    }

    async fn connect(coord: &SessionCoordinator, name: &str) -> (ConnectionId, OutboundReceiver) {
        let (tx, rx) = outbound_channel(64);
        let id = coord.connect(user(name), tx).await.unwrap();
        (id, rx)
    }

    fn kinds(events: &[(String, Event)]) -> Vec<&'static str> {
        events.iter().map(|(_, e)| e.name()).collect()
    }

    fn assert_coherent(coord: &SessionCoordinator) {
        for connection_id in coord.membership().subscribed_connections() {
            assert!(
                coord.registry().get(&connection_id).is_some(),
                "dangling subscriber {connection_id}"
            );
        }
    }

    #[tokio::test]
    async fn test_direct_message_scenario() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());

        // An older conversation with u3
        coord
            .send_direct_message(&user("u3"), user("u2"), MessagePayload::text("old"))
            .await
            .unwrap();

        let (_c1, mut rx1) = connect(&coord, "u1").await;
        let (_c2, mut rx2) = connect(&coord, "u2").await;
        drain_events(&mut rx1);
        drain_events(&mut rx2);

        let report = coord
            .send_direct_message(&user("u1"), user("u2"), MessagePayload::text("hi"))
            .await
            .unwrap();
        assert!(report.created_id.is_some());

        let events = drain_events(&mut rx2);
        assert_eq!(kinds(&events), vec!["message_sent", "chat_list_refreshed"]);
        assert_eq!(events[0].0, "user:u2");
        let Event::MessageSent { sent_at, .. } = &events[0].1 else {
            panic!("expected message");
        };
        let (channel, Event::ChatListRefreshed { snapshot, .. }) = &events[1] else {
            panic!("expected chat list");
        };
        assert_eq!(channel, "chatlist:u2");
        assert_eq!(snapshot.chats[0].chat, ChatKey::User(user("u1")));
        assert_eq!(snapshot.chats[0].unread_count, 1);
        assert_eq!(snapshot.chats[0].last_activity_at, Some(*sent_at));
        assert_eq!(snapshot.chats[1].chat, ChatKey::User(user("u3")));
        assert_eq!(snapshot.total_unread, 2);

        // The sender's tab sees its own message echoed, then its own chat list
        let events = drain_events(&mut rx1);
        assert_eq!(kinds(&events), vec!["message_sent", "chat_list_refreshed"]);
        assert_eq!(events[0].0, "user:u1");
    }

    #[tokio::test]
    async fn test_failed_persist_routes_nothing() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let (_c1, mut rx1) = connect(&coord, "u1").await;
        let (_c2, mut rx2) = connect(&coord, "u2").await;
        drain_events(&mut rx1);
        drain_events(&mut rx2);

        store.fail_writes.store(true, Ordering::SeqCst);
        let summaries_before = store.summaries.load(Ordering::SeqCst);

        let err = coord
            .send_direct_message(&user("u1"), user("u2"), MessagePayload::text("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::PERSISTENCE_FAILURE);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 1);
        assert!(coord
            .mark_chat_read(&user("u2"), ChatKey::User(user("u1")))
            .await
            .is_err());

        assert_eq!(store.summaries.load(Ordering::SeqCst), summaries_before);
        assert!(drain_events(&mut rx1).is_empty());
        assert!(drain_events(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected_before_store() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());

        let err = coord
            .send_direct_message(&user("u1"), user("u2"), MessagePayload::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REQUEST);
        assert_eq!(store.inserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mark_read_always_refreshes() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let (_c1, mut rx1) = connect(&coord, "u1").await;
        drain_events(&mut rx1);

        coord
            .mark_chat_read(&user("u1"), ChatKey::User(user("nobody")))
            .await
            .unwrap();
        let events = drain_events(&mut rx1);
        assert_eq!(kinds(&events), vec!["read_receipt", "chat_list_refreshed"]);
        let Event::ChatListRefreshed { snapshot, .. } = &events[1].1 else {
            panic!("expected chat list");
        };
        assert!(snapshot.chats.is_empty());

        // Nothing left to read, still a fresh snapshot
        coord
            .mark_chat_read(&user("u1"), ChatKey::User(user("nobody")))
            .await
            .unwrap();
        assert_eq!(drain_events(&mut rx1).len(), 2);
    }

    #[tokio::test]
    async fn test_group_removal_scenario() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let group = coord
            .create_group(&user("u2"), "Team", vec![user("u1"), user("u3")])
            .await
            .unwrap()
            .created_id
            .map(GroupId::new)
            .unwrap();

        let mut rxs = Vec::new();
        for name in ["u1", "u2", "u3"] {
            let (conn, rx) = connect(&coord, name).await;
            assert!(coord.subscribe_to_group_room(&conn, group).await.unwrap());
            rxs.push(rx);
        }
        for rx in &mut rxs {
            drain_events(rx);
        }

        coord
            .remove_member(&user("u2"), group, user("u1"))
            .await
            .unwrap();
        coord
            .update_group(
                &user("u2"),
                group,
                GroupFields {
                    name: Some("Core team".into()),
                    ..GroupFields::default()
                },
            )
            .await
            .unwrap();

        let room = format!("group:{group}");
        let room_events = |events: Vec<(String, Event)>| -> Vec<&'static str> {
            events
                .into_iter()
                .filter(|(channel, _)| channel == &room)
                .map(|(_, e)| e.name())
                .collect()
        };

        assert!(room_events(drain_events(&mut rxs[0])).is_empty());
        for rx in &mut rxs[1..] {
            assert_eq!(
                room_events(drain_events(rx)),
                vec!["membership_changed", "group_updated"]
            );
        }
        assert_coherent(&coord);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_room_join_cannot_outlive_concurrent_removal() {
        let store = SpyStore::new();
        let coord = Arc::new(coordinator(store.clone()));
        let group = GroupId::new(
            coord
                .create_group(&user("u2"), "Team", vec![user("u1"), user("u3")])
                .await
                .unwrap()
                .created_id
                .unwrap(),
        );
        let (c1, mut rx1) = connect(&coord, "u1").await;
        let (c2, mut rx2) = connect(&coord, "u2").await;
        assert!(coord.subscribe_to_group_room(&c2, group).await.unwrap());

        // The join has read the member list but not subscribed yet
        store.hold_members.store(true, Ordering::SeqCst);
        let join = tokio::spawn({
            let coord = coord.clone();
            let c1 = c1.clone();
            async move { coord.subscribe_to_group_room(&c1, group).await }
        });
        store.members_parked.notified().await;

        let removal = tokio::spawn({
            let coord = coord.clone();
            async move { coord.remove_member(&user("u2"), group, user("u1")).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!removal.is_finished());

        store.members_release.notify_one();
        assert!(join.await.unwrap().unwrap());
        removal.await.unwrap().unwrap();

        let room = ChannelId::GroupRoom(group);
        assert!(!coord.membership().subscribers_of(&room).contains(&c1));
        assert!(coord.membership().subscribers_of(&room).contains(&c2));

        drain_events(&mut rx1);
        drain_events(&mut rx2);
        coord
            .update_group(
                &user("u2"),
                group,
                GroupFields {
                    name: Some("Core team".into()),
                    ..GroupFields::default()
                },
            )
            .await
            .unwrap();

        let room_name = room.to_string();
        assert!(drain_events(&mut rx1)
            .iter()
            .all(|(channel, _)| channel != &room_name));
        assert!(drain_events(&mut rx2)
            .iter()
            .any(|(channel, event)| channel == &room_name && event.name() == "group_updated"));
        assert_coherent(&coord);
    }

    #[tokio::test]
    async fn test_group_message_looks_up_members_once() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let group = GroupId::new(
            coord
                .create_group(&user("u1"), "Team", vec![user("u2")])
                .await
                .unwrap()
                .created_id
                .unwrap(),
        );
        let (_c2, mut rx2) = connect(&coord, "u2").await;
        drain_events(&mut rx2);

        let before = store.member_lookups.load(Ordering::SeqCst);
        coord
            .send_group_message(&user("u1"), group, MessagePayload::text("hi"))
            .await
            .unwrap();
        assert_eq!(store.member_lookups.load(Ordering::SeqCst) - before, 1);

        let events = drain_events(&mut rx2);
        assert_eq!(kinds(&events), vec!["message_sent", "chat_list_refreshed"]);
        assert_eq!(events[0].0, "chatlist:u2");
    }

    #[tokio::test]
    async fn test_profile_update_reaches_every_connection() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let (_a1, mut rx_a1) = connect(&coord, "alice").await;
        let (_a2, mut rx_a2) = connect(&coord, "alice").await;
        let (_b, mut rx_b) = connect(&coord, "bob").await;
        for rx in [&mut rx_a1, &mut rx_a2, &mut rx_b] {
            drain_events(rx);
        }

        let report = coord
            .update_profile(
                &user("bob"),
                ProfileFields {
                    display_name: Some("Bobby".into()),
                    ..ProfileFields::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(report.deliveries.delivered, 3);

        for rx in [&mut rx_a1, &mut rx_a2] {
            let events = drain_events(rx);
            assert!(matches!(
                &events[..],
                [(channel, Event::ProfileUpdated { user_id, .. })]
                    if channel == "everyone" && user_id.as_str() == "bob"
            ));
        }
        // No chat list refresh follows a profile change
        assert_eq!(kinds(&drain_events(&mut rx_b)), vec!["profile_updated"]);

        // An empty update never reaches the store
        store.fail_writes.store(true, Ordering::SeqCst);
        let err = coord
            .update_profile(&user("bob"), ProfileFields::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::INVALID_REQUEST);
        assert!(drain_events(&mut rx_a1).is_empty());
    }

    #[tokio::test]
    async fn test_failed_summary_skips_only_that_user() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let (_c1, mut rx1) = connect(&coord, "u1").await;
        let (_c2, mut rx2) = connect(&coord, "u2").await;
        drain_events(&mut rx1);
        drain_events(&mut rx2);

        store.fail_summary_for(&user("u1"));
        let report = coord
            .send_direct_message(&user("u1"), user("u2"), MessagePayload::text("hi"))
            .await
            .unwrap();
        assert!(report.created_id.is_some());

        assert_eq!(kinds(&drain_events(&mut rx2)), vec!["message_sent", "chat_list_refreshed"]);
        assert_eq!(kinds(&drain_events(&mut rx1)), vec!["message_sent"]);

        let err = coord.refresh_chat_list(&user("u1")).await.unwrap_err();
        assert_eq!(err.code(), codes::PERSISTENCE_FAILURE);
        assert!(drain_events(&mut rx1).is_empty());

        let snapshot = coord.refresh_chat_list(&user("u2")).await.unwrap();
        assert_eq!(snapshot.total_unread, 1);
    }

    #[tokio::test]
    async fn test_added_member_joins_room_before_announcement() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let group = GroupId::new(
            coord
                .create_group(&user("u1"), "Team", vec![])
                .await
                .unwrap()
                .created_id
                .unwrap(),
        );
        let (_c2, mut rx2) = connect(&coord, "u2").await;
        drain_events(&mut rx2);

        coord.add_member(&user("u1"), group, user("u2")).await.unwrap();
        let events = drain_events(&mut rx2);
        assert_eq!(events[0].0, format!("group:{group}"));
        assert_eq!(kinds(&events), vec!["membership_changed", "chat_list_refreshed"]);

        // Adding again is a no-op
        let report = coord.add_member(&user("u1"), group, user("u2")).await.unwrap();
        assert_eq!(report, ActionReport::default());
    }

    #[tokio::test]
    async fn test_group_room_requires_membership() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let group = GroupId::new(
            coord
                .create_group(&user("u1"), "Team", vec![])
                .await
                .unwrap()
                .created_id
                .unwrap(),
        );
        let (c2, _rx2) = connect(&coord, "u2").await;

        let err = coord.subscribe_to_group_room(&c2, group).await.unwrap_err();
        assert!(matches!(err, SessionError::NotMember(_)));
        assert_eq!(err.code(), codes::FORBIDDEN);

        let ghost = ConnectionId::new("conn_ghost");
        let err = coord.subscribe_to_group_room(&ghost, group).await.unwrap_err();
        assert_eq!(err.code(), codes::UNKNOWN_CONNECTION);
    }

    #[tokio::test]
    async fn test_group_message_survives_member_lookup_failure() {
        let store = SpyStore::new();
        let coord = coordinator(store.clone());
        let group = GroupId::new(
            coord
                .create_group(&user("u1"), "Team", vec![user("u2")])
                .await
                .unwrap()
                .created_id
                .unwrap(),
        );
        let (_c1, mut rx1) = connect(&coord, "u1").await;
        drain_events(&mut rx1);

        store.fail_members.store(true, Ordering::SeqCst);
        let report = coord
            .send_group_message(&user("u1"), group, MessagePayload::text("hi"))
            .await
            .unwrap();
        assert!(report.created_id.is_some());

        // Only the fallback refresh of the sender gets through
        assert_eq!(kinds(&drain_events(&mut rx1)), vec!["chat_list_refreshed"]);
    }

    #[tokio::test]
    async fn test_presence_and_disconnect() {
        let store = SpyStore::new();
        let coord = coordinator(store);

        let (a1, mut rx_a) = connect(&coord, "alice").await;
        let (a2, _rx_a2) = connect(&coord, "alice").await;
        let (b1, mut rx_b) = connect(&coord, "bob").await;
        drain_events(&mut rx_a);
        drain_events(&mut rx_b);
        assert_eq!(coord.online_users(), vec![user("alice"), user("bob")]);

        assert!(coord.disconnect(&a1).await);
        assert!(!coord.disconnect(&a1).await);
        assert!(drain_events(&mut rx_b).is_empty());

        assert!(coord.disconnect(&a2).await);
        let events = drain_events(&mut rx_b);
        assert!(matches!(
            &events[..],
            [(_, Event::PresenceChanged { online: false, .. })]
        ));
        assert_eq!(coord.online_users(), vec![user("bob")]);

        coord.disconnect(&b1).await;
        assert_eq!(coord.registry().stats().connection_count, 0);
        assert_eq!(coord.membership().stats().total_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_typing_and_history() {
        let store = SpyStore::new();
        let coord = coordinator(store);
        let (_b, mut rx_b) = connect(&coord, "bob").await;
        drain_events(&mut rx_b);

        let report = coord.typing(&user("alice"), user("bob"), true).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(kinds(&drain_events(&mut rx_b)), vec!["typing"]);

        for text in ["a", "b", "c"] {
            coord
                .send_direct_message(&user("alice"), user("bob"), MessagePayload::text(text))
                .await
                .unwrap();
        }
        let page = coord
            .history(&user("bob"), &ChatKey::User(user("alice")), Some(2))
            .await
            .unwrap();
        let texts: Vec<_> = page.iter().filter_map(|m| m.payload.text.clone()).collect();
        assert_eq!(texts, vec!["b", "c"]);

        let snapshot = coord.refresh_chat_list(&user("bob")).await.unwrap();
        assert_eq!(snapshot.total_unread, 3);
    }

    #[tokio::test]
    async fn test_membership_stays_coherent() {
        let store = SpyStore::new();
        let coord = coordinator(store);
        let mut live: Vec<ConnectionId> = Vec::new();
        let mut receivers = Vec::new();
        let mut seed: u64 = 0x2545_f491;

        for step in 0..300u64 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let pick = (seed >> 33) as usize;
            match pick % 4 {
                0 | 1 => {
                    let (tx, rx) = outbound_channel(4);
                    let name = format!("u{}", pick % 5);
                    live.push(coord.connect(user(&name), tx).await.unwrap());
                    receivers.push(rx);
                }
                2 if !live.is_empty() => {
                    let conn = live.swap_remove(pick % live.len());
                    coord.disconnect(&conn).await;
                    // A second close from an overlapping signal is harmless
                    coord.disconnect(&conn).await;
                }
                _ if !live.is_empty() => {
                    let conn = &live[pick % live.len()];
                    let room = ChannelId::GroupRoom(GroupId::new(step % 3));
                    let _ = coord.membership().subscribe(conn, &room);
                }
                _ => {}
            }
            assert_coherent(&coord);
        }

        let expected: HashSet<UserId> = live.iter().filter_map(|c| coord.user_of(c)).collect();
        let online: HashSet<UserId> = coord.online_users().into_iter().collect();
        assert_eq!(online, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connect_disconnect() {
        let store = SpyStore::new();
        let coord = Arc::new(coordinator(store));

        let mut handles = Vec::new();
        for task in 0..16 {
            let coord = coord.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("user{}", task % 4);
                for round in 0..25u64 {
                    let (tx, _rx) = outbound_channel(16);
                    let conn = coord.connect(user(&name), tx).await.unwrap();
                    let room = ChannelId::GroupRoom(GroupId::new(round % 2));
                    let _ = coord.membership().subscribe(&conn, &room);
                    coord.disconnect(&conn).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(coord.registry().stats().connection_count, 0);
        assert_eq!(coord.registry().stats().user_count, 0);
        assert_eq!(coord.membership().stats().total_subscriptions, 0);
        assert!(coord.online_users().is_empty());
    }
}
