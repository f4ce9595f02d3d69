//! In-memory [`ChatStore`].
//!
//! Keeps everything in plain maps behind one `RwLock`. Used by the server
//! binary when no external store is wired in, and by tests.

use crate::store::{ChatStore, NewMessage, StoreError};
use async_trait::async_trait;
use parley_protocol::{
    ChatKey, ChatSummary, GroupFields, GroupId, MessageId, MessageTarget, ProfileFields,
    StoredMessage, UserId,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[derive(Debug)]
struct Group {
    fields: GroupFields,
    creator: UserId,
    members: BTreeSet<UserId>,
}

#[derive(Debug)]
struct MessageRecord {
    message: StoredMessage,
    /// Direct messages only: whether the receiver has read it.
    read: bool,
}

#[derive(Debug, Default)]
struct State {
    last_message_id: MessageId,
    last_group_id: u64,
    profiles: HashMap<UserId, ProfileFields>,
    groups: HashMap<GroupId, Group>,
    /// Insertion order, which is also message id order.
    messages: Vec<MessageRecord>,
    /// Highest group message id each member has read.
    group_read: HashMap<(UserId, GroupId), MessageId>,
}

impl State {
    fn group(&self, group_id: &GroupId) -> Result<&Group, StoreError> {
        self.groups
            .get(group_id)
            .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))
    }

    fn group_mut(&mut self, group_id: &GroupId) -> Result<&mut Group, StoreError> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| StoreError::NotFound(format!("group {group_id}")))
    }

    fn member_group(&self, user_id: &UserId, group_id: &GroupId) -> Result<&Group, StoreError> {
        let group = self.group(group_id)?;
        if !group.members.contains(user_id) {
            return Err(StoreError::Forbidden(format!(
                "{user_id} is not a member of group {group_id}"
            )));
        }
        Ok(group)
    }

    fn latest_group_message(&self, group_id: &GroupId) -> MessageId {
        self.messages
            .iter()
            .rev()
            .find(|r| is_group_message(&r.message, group_id))
            .map_or(0, |r| r.message.message_id)
    }

    fn display_name(&self, user_id: &UserId) -> String {
        let Some(profile) = self.profiles.get(user_id) else {
            return user_id.to_string();
        };
        if let Some(name) = profile.display_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }
        let full = [profile.first_name.as_deref(), profile.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if full.is_empty() {
            user_id.to_string()
        } else {
            full
        }
    }
}

fn is_group_message(message: &StoredMessage, group_id: &GroupId) -> bool {
    matches!(&message.target, MessageTarget::Group { group_id: g } if g == group_id)
}

/// The other party of a direct message as seen by `user_id`, if the user
/// took part in it.
fn counterpart<'a>(message: &'a StoredMessage, user_id: &UserId) -> Option<&'a UserId> {
    let MessageTarget::Direct { receiver_id } = &message.target else {
        return None;
    };
    if &message.sender_id == user_id {
        Some(receiver_id)
    } else if receiver_id == user_id {
        Some(&message.sender_id)
    } else {
        None
    }
}

/// In-memory chat store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn insert_message(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        if message.payload.is_empty() {
            return Err(StoreError::Invalid("message has no text or attachment".to_string()));
        }

        let mut state = self.write()?;
        if let MessageTarget::Group { group_id } = &message.target {
            state.member_group(&message.sender_id, group_id)?;
        }

        state.last_message_id += 1;
        let message_id = state.last_message_id;
        state.messages.push(MessageRecord {
            message: StoredMessage {
                message_id,
                sender_id: message.sender_id,
                target: message.target,
                payload: message.payload,
                sent_at: message.sent_at,
            },
            read: false,
        });
        Ok(message_id)
    }

    async fn list_messages(
        &self,
        user_id: &UserId,
        chat: &ChatKey,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let state = self.read()?;
        let matching: Vec<&StoredMessage> = match chat {
            ChatKey::User(other) => state
                .messages
                .iter()
                .map(|r| &r.message)
                .filter(|m| counterpart(m, user_id) == Some(other))
                .collect(),
            ChatKey::Group(group_id) => {
                state.member_group(user_id, group_id)?;
                state
                    .messages
                    .iter()
                    .map(|r| &r.message)
                    .filter(|m| is_group_message(m, group_id))
                    .collect()
            }
        };

        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).cloned().collect())
    }

    async fn mark_read(&self, user_id: &UserId, chat: &ChatKey) -> Result<(), StoreError> {
        let mut state = self.write()?;
        match chat {
            ChatKey::User(other) => {
                let mut flipped = 0usize;
                for record in state.messages.iter_mut().filter(|r| !r.read) {
                    let m = &record.message;
                    if &m.sender_id == other
                        && matches!(&m.target, MessageTarget::Direct { receiver_id } if receiver_id == user_id)
                    {
                        record.read = true;
                        flipped += 1;
                    }
                }
                debug!(user = %user_id, chat = %chat, flipped, "Marked direct chat read");
            }
            ChatKey::Group(group_id) => {
                state.member_group(user_id, group_id)?;
                let latest = state.latest_group_message(group_id);
                state.group_read.insert((user_id.clone(), *group_id), latest);
                debug!(user = %user_id, chat = %chat, watermark = latest, "Marked group chat read");
            }
        }
        Ok(())
    }

    async fn unread_summary(&self, user_id: &UserId) -> Result<Vec<ChatSummary>, StoreError> {
        let state = self.read()?;
        let mut chats: BTreeMap<ChatKey, (u32, Option<u64>)> = BTreeMap::new();

        for (group_id, group) in &state.groups {
            if group.members.contains(user_id) {
                chats.insert(ChatKey::Group(*group_id), (0, None));
            }
        }

        for record in &state.messages {
            let m = &record.message;
            let (key, unread) = match &m.target {
                MessageTarget::Direct { .. } => {
                    let Some(other) = counterpart(m, user_id) else {
                        continue;
                    };
                    let unread = !record.read && &m.sender_id != user_id;
                    (ChatKey::User(other.clone()), unread)
                }
                MessageTarget::Group { group_id } => {
                    let key = ChatKey::Group(*group_id);
                    if !chats.contains_key(&key) {
                        continue;
                    }
                    let watermark = state
                        .group_read
                        .get(&(user_id.clone(), *group_id))
                        .copied()
                        .unwrap_or(0);
                    let unread = m.message_id > watermark && &m.sender_id != user_id;
                    (key, unread)
                }
            };

            let entry = chats.entry(key).or_insert((0, None));
            if unread {
                entry.0 += 1;
            }
            entry.1 = Some(entry.1.map_or(m.sent_at, |t| t.max(m.sent_at)));
        }

        Ok(chats
            .into_iter()
            .map(|(chat, (unread_count, last_activity_at))| {
                let display_name = match &chat {
                    ChatKey::User(other) => state.display_name(other),
                    ChatKey::Group(group_id) => state
                        .groups
                        .get(group_id)
                        .and_then(|g| g.fields.name.clone())
                        .unwrap_or_else(|| format!("group {group_id}")),
                };
                ChatSummary {
                    chat,
                    display_name,
                    unread_count,
                    last_activity_at,
                }
            })
            .collect())
    }

    async fn list_members(&self, group_id: &GroupId) -> Result<Vec<UserId>, StoreError> {
        let state = self.read()?;
        Ok(state.group(group_id)?.members.iter().cloned().collect())
    }

    async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<GroupId, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("group name is empty".to_string()));
        }

        let mut state = self.write()?;
        state.last_group_id += 1;
        let group_id = GroupId::new(state.last_group_id);

        let mut all: BTreeSet<UserId> = members.iter().cloned().collect();
        all.insert(creator.clone());
        state.groups.insert(
            group_id,
            Group {
                fields: GroupFields {
                    name: Some(name.to_string()),
                    ..GroupFields::default()
                },
                creator: creator.clone(),
                members: all,
            },
        );
        debug!(group = %group_id, creator = %creator, "Group created");
        Ok(group_id)
    }

    async fn add_member(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        state.member_group(actor, group_id)?;
        // History from before joining does not count as unread.
        let latest = state.latest_group_message(group_id);

        let added = state.group_mut(group_id)?.members.insert(user_id.clone());
        if added {
            state.group_read.insert((user_id.clone(), *group_id), latest);
        }
        Ok(added)
    }

    async fn remove_member(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let group = state.group_mut(group_id)?;
        if &group.creator != actor {
            return Err(StoreError::Forbidden(format!(
                "only the creator of group {group_id} may remove members"
            )));
        }
        if &group.creator == user_id {
            return Err(StoreError::Forbidden(format!(
                "the creator of group {group_id} cannot be removed"
            )));
        }
        if !group.members.remove(user_id) {
            return Err(StoreError::NotFound(format!(
                "{user_id} is not a member of group {group_id}"
            )));
        }
        state.group_read.remove(&(user_id.clone(), *group_id));
        Ok(())
    }

    async fn update_group(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        fields: &GroupFields,
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Err(StoreError::Invalid("group update changes nothing".to_string()));
        }
        if fields.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(StoreError::Invalid("group name is empty".to_string()));
        }

        let mut state = self.write()?;
        state.member_group(actor, group_id)?;
        let group = state.group_mut(group_id)?;
        if let Some(name) = &fields.name {
            group.fields.name = Some(name.trim().to_string());
        }
        if fields.description.is_some() {
            group.fields.description.clone_from(&fields.description);
        }
        if fields.image_url.is_some() {
            group.fields.image_url.clone_from(&fields.image_url);
        }
        Ok(())
    }

    async fn update_profile(
        &self,
        user_id: &UserId,
        fields: &ProfileFields,
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Err(StoreError::Invalid("profile update changes nothing".to_string()));
        }

        let mut state = self.write()?;
        let profile = state.profiles.entry(user_id.clone()).or_default();
        if fields.first_name.is_some() {
            profile.first_name.clone_from(&fields.first_name);
        }
        if fields.last_name.is_some() {
            profile.last_name.clone_from(&fields.last_name);
        }
        if fields.display_name.is_some() {
            profile.display_name.clone_from(&fields.display_name);
        }
        if fields.photo_url.is_some() {
            profile.photo_url.clone_from(&fields.photo_url);
        }
        Ok(())
    }
}
