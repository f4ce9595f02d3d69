//! Persistence collaborator contract.
//!
//! The core never owns durable state. Everything it knows about messages,
//! groups and read state comes through [`ChatStore`].

use async_trait::async_trait;
use parley_protocol::{
    ChatKey, ChatSummary, GroupFields, GroupId, MessageId, MessagePayload, MessageTarget,
    ProfileFields, StoredMessage, UserId,
};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced user, group or chat does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The acting user may not perform the write.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The write was rejected as invalid.
    #[error("Invalid: {0}")]
    Invalid(String),

    /// The store could not be reached or failed internally.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A message to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub target: MessageTarget,
    /// Body.
    pub payload: MessagePayload,
    /// Send time (ms).
    pub sent_at: u64,
}

/// The durable store the core reads from and writes through.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persist a message and return its identifier.
    async fn insert_message(&self, message: NewMessage) -> Result<MessageId, StoreError>;

    /// Messages in a chat as seen by `user_id`, oldest first, at most `limit`
    /// of the most recent.
    async fn list_messages(
        &self,
        user_id: &UserId,
        chat: &ChatKey,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Mark everything in a chat read for a user. Succeeds even if nothing
    /// was unread.
    async fn mark_read(&self, user_id: &UserId, chat: &ChatKey) -> Result<(), StoreError>;

    /// Unread count and last activity of every chat of a user, direct and
    /// group, in one call.
    async fn unread_summary(&self, user_id: &UserId) -> Result<Vec<ChatSummary>, StoreError>;

    /// Current members of a group.
    async fn list_members(&self, group_id: &GroupId) -> Result<Vec<UserId>, StoreError>;

    /// Create a group owned by `creator` and return its identifier.
    async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<GroupId, StoreError>;

    /// Add a member. Returns `false` if they were already a member.
    async fn add_member(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<bool, StoreError>;

    /// Remove a member. Only the group creator may remove members, and the
    /// creator cannot be removed.
    async fn remove_member(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<(), StoreError>;

    /// Apply a partial group update.
    async fn update_group(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        fields: &GroupFields,
    ) -> Result<(), StoreError>;

    /// Apply a partial profile update.
    async fn update_profile(&self, user_id: &UserId, fields: &ProfileFields)
        -> Result<(), StoreError>;
}
