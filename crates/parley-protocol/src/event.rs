//! Events pushed to connected clients.
//!
//! An [`Event`] is a domain event (something persisted happened) or one of
//! the derived pseudo-events the core produces on its own: presence changes,
//! reconciled chat lists and typing indicators.

use crate::ids::{ChatKey, GroupId, MessageId, UserId};
use serde::{Deserialize, Serialize};

/// A file attachment reference. The bytes live in external file storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Original file name.
    pub file_name: String,
    /// Where the stored file can be fetched.
    pub url: String,
    /// MIME type, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Size in bytes, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Message body: text, an attachment, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Message text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attached file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
}

impl MessagePayload {
    /// A text-only payload.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            attachment: None,
        }
    }

    /// Whether the payload carries nothing to deliver.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attachment.is_none() && self.text.as_deref().map_or(true, |t| t.trim().is_empty())
    }
}

/// Where a message was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageTarget {
    /// One-to-one message.
    Direct {
        /// Receiving user.
        receiver_id: UserId,
    },
    /// Message to a group room.
    Group {
        /// Receiving group.
        group_id: GroupId,
    },
}

/// Partial profile update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    /// Given name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Family name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Name shown in chat lists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Avatar location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl ProfileFields {
    /// Whether the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.display_name.is_none()
            && self.photo_url.is_none()
    }
}

/// Partial group update. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFields {
    /// Group name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Group image location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl GroupFields {
    /// Whether the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.image_url.is_none()
    }
}

/// One chat in a user's chat list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Which chat.
    pub chat: ChatKey,
    /// Counterpart or group name.
    pub display_name: String,
    /// Messages the user has not read yet.
    pub unread_count: u32,
    /// Timestamp (ms) of the latest activity, `None` if the chat is empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<u64>,
}

/// A fully recomputed chat list for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSnapshot {
    /// Owner of the chat list.
    pub user_id: UserId,
    /// Chats in display order.
    pub chats: Vec<ChatSummary>,
    /// Sum of all unread counts.
    pub total_unread: u64,
    /// When the snapshot was computed (ms).
    pub generated_at: u64,
}

/// A persisted message, as returned by history queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned identifier.
    pub message_id: MessageId,
    /// Author.
    pub sender_id: UserId,
    /// Recipient.
    pub target: MessageTarget,
    /// Body.
    pub payload: MessagePayload,
    /// Send time (ms).
    pub sent_at: u64,
}

/// An event routed to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// A message was persisted.
    MessageSent {
        /// Store-assigned identifier.
        message_id: MessageId,
        /// Author.
        sender_id: UserId,
        /// Recipient.
        target: MessageTarget,
        /// Body.
        payload: MessagePayload,
        /// Send time (ms).
        sent_at: u64,
    },

    /// A user's profile changed.
    ProfileUpdated {
        /// Whose profile.
        user_id: UserId,
        /// Changed fields.
        fields: ProfileFields,
    },

    /// A group's details changed.
    GroupUpdated {
        /// Which group.
        group_id: GroupId,
        /// Changed fields.
        fields: GroupFields,
    },

    /// A member joined or left a group.
    MembershipChanged {
        /// Which group.
        group_id: GroupId,
        /// Added or removed member.
        user_id: UserId,
        /// `true` when added.
        added: bool,
    },

    /// A user read a chat.
    ReadReceipt {
        /// Reader.
        user_id: UserId,
        /// Chat that was read.
        chat: ChatKey,
    },

    /// A user came online or went offline.
    PresenceChanged {
        /// Whose presence.
        user_id: UserId,
        /// New state.
        online: bool,
    },

    /// A reconciled chat list.
    ChatListRefreshed {
        /// Owner of the chat list.
        user_id: UserId,
        /// The snapshot.
        snapshot: UnreadSnapshot,
    },

    /// A user started or stopped typing to another user.
    Typing {
        /// Who is typing.
        user_id: UserId,
        /// Who they are typing to.
        receiver_id: UserId,
        /// Started or stopped.
        typing: bool,
    },
}

impl Event {
    /// Short event name for logs and metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::MessageSent { .. } => "message_sent",
            Event::ProfileUpdated { .. } => "profile_updated",
            Event::GroupUpdated { .. } => "group_updated",
            Event::MembershipChanged { .. } => "membership_changed",
            Event::ReadReceipt { .. } => "read_receipt",
            Event::PresenceChanged { .. } => "presence_changed",
            Event::ChatListRefreshed { .. } => "chat_list_refreshed",
            Event::Typing { .. } => "typing",
        }
    }
}
