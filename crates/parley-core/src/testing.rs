//! Test doubles shared by the unit tests.

use crate::connection::OutboundReceiver;
use crate::memory::MemoryStore;
use crate::store::{ChatStore, NewMessage, StoreError};
use async_trait::async_trait;
use parley_protocol::{
    ChatKey, ChatSummary, Event, Frame, GroupFields, GroupId, MessageId, ProfileFields,
    StoredMessage, UserId,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// A [`MemoryStore`] that counts calls and can be told to fail.
#[derive(Default)]
pub(crate) struct SpyStore {
    inner: MemoryStore,
    pub inserts: AtomicUsize,
    pub summaries: AtomicUsize,
    pub member_lookups: AtomicUsize,
    pub fail_writes: AtomicBool,
    pub fail_members: AtomicBool,
    /// Users whose unread summary fails.
    pub fail_summaries: Mutex<HashSet<UserId>>,
    /// Park the next member lookup until `members_release` is notified.
    pub hold_members: AtomicBool,
    pub members_parked: Notify,
    pub members_release: Notify,
}

impl SpyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_summary_for(&self, user_id: &UserId) {
        self.fail_summaries.lock().unwrap().insert(user_id.clone());
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChatStore for SpyStore {
    async fn insert_message(&self, message: NewMessage) -> Result<MessageId, StoreError> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_writes)?;
        self.inner.insert_message(message).await
    }

    async fn list_messages(
        &self,
        user_id: &UserId,
        chat: &ChatKey,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.inner.list_messages(user_id, chat, limit).await
    }

    async fn mark_read(&self, user_id: &UserId, chat: &ChatKey) -> Result<(), StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.mark_read(user_id, chat).await
    }

    async fn unread_summary(&self, user_id: &UserId) -> Result<Vec<ChatSummary>, StoreError> {
        self.summaries.fetch_add(1, Ordering::SeqCst);
        if self.fail_summaries.lock().unwrap().contains(user_id) {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        self.inner.unread_summary(user_id).await
    }

    async fn list_members(&self, group_id: &GroupId) -> Result<Vec<UserId>, StoreError> {
        self.member_lookups.fetch_add(1, Ordering::SeqCst);
        let members = self.inner.list_members(group_id).await;
        if self.hold_members.swap(false, Ordering::SeqCst) {
            self.members_parked.notify_one();
            self.members_release.notified().await;
        }
        Self::check(&self.fail_members)?;
        members
    }

    async fn create_group(
        &self,
        creator: &UserId,
        name: &str,
        members: &[UserId],
    ) -> Result<GroupId, StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.create_group(creator, name, members).await
    }

    async fn add_member(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<bool, StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.add_member(actor, group_id, user_id).await
    }

    async fn remove_member(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.remove_member(actor, group_id, user_id).await
    }

    async fn update_group(
        &self,
        actor: &UserId,
        group_id: &GroupId,
        fields: &GroupFields,
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.update_group(actor, group_id, fields).await
    }

    async fn update_profile(
        &self,
        user_id: &UserId,
        fields: &ProfileFields,
    ) -> Result<(), StoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.update_profile(user_id, fields).await
    }
}

pub(crate) fn user(name: &str) -> UserId {
    UserId::new(name).unwrap()
}

/// Everything queued on a connection so far, as `(channel, event)` pairs.
pub(crate) fn drain_events(rx: &mut OutboundReceiver) -> Vec<(String, Event)> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let Frame::Event { channel, event } = &*frame {
            events.push((channel.clone(), event.clone()));
        }
    }
    events
}
