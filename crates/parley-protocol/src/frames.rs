//! Frame types for the Parley protocol.
//!
//! Frames are the fundamental unit of communication between a client and the
//! gateway. Requests carry an `id` that the server echoes in its `Ack`,
//! `Error` or typed reply.

use crate::event::{
    Event, GroupFields, MessagePayload, ProfileFields, StoredMessage, UnreadSnapshot,
};
use crate::ids::{ChatKey, GroupId, MessageId, UserId};
use crate::version::Version;
use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// The frame could not be decoded or is not a request.
    pub const INVALID_FRAME: u16 = 1001;
    /// Subscribing to a channel failed.
    pub const SUBSCRIBE_FAILED: u16 = 1002;
    /// The store rejected or failed the write.
    pub const PERSISTENCE_FAILURE: u16 = 1003;
    /// The user may not perform this action.
    pub const FORBIDDEN: u16 = 1004;
    /// The referenced user, group or chat does not exist.
    pub const NOT_FOUND: u16 = 1005;
    /// The request is well-formed but invalid.
    pub const INVALID_REQUEST: u16 = 1006;
    /// The connection is no longer registered.
    pub const UNKNOWN_CONNECTION: u16 = 1007;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    SubscribeGroup = 0x01,
    UnsubscribeGroup = 0x02,
    SendDirect = 0x03,
    SendGroup = 0x04,
    MarkRead = 0x05,
    UpdateProfile = 0x06,
    UpdateGroup = 0x07,
    CreateGroup = 0x08,
    AddMember = 0x09,
    RemoveMember = 0x0A,
    Typing = 0x0B,
    SyncChatList = 0x0C,
    History = 0x0D,
    OnlineUsers = 0x0E,
    Ping = 0x0F,
    Pong = 0x10,
    Connected = 0x20,
    Ack = 0x21,
    Error = 0x22,
    Event = 0x23,
    ChatList = 0x24,
    HistoryPage = 0x25,
    OnlineUsersList = 0x26,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::SubscribeGroup),
            0x02 => Ok(FrameType::UnsubscribeGroup),
            0x03 => Ok(FrameType::SendDirect),
            0x04 => Ok(FrameType::SendGroup),
            0x05 => Ok(FrameType::MarkRead),
            0x06 => Ok(FrameType::UpdateProfile),
            0x07 => Ok(FrameType::UpdateGroup),
            0x08 => Ok(FrameType::CreateGroup),
            0x09 => Ok(FrameType::AddMember),
            0x0A => Ok(FrameType::RemoveMember),
            0x0B => Ok(FrameType::Typing),
            0x0C => Ok(FrameType::SyncChatList),
            0x0D => Ok(FrameType::History),
            0x0E => Ok(FrameType::OnlineUsers),
            0x0F => Ok(FrameType::Ping),
            0x10 => Ok(FrameType::Pong),
            0x20 => Ok(FrameType::Connected),
            0x21 => Ok(FrameType::Ack),
            0x22 => Ok(FrameType::Error),
            0x23 => Ok(FrameType::Event),
            0x24 => Ok(FrameType::ChatList),
            0x25 => Ok(FrameType::HistoryPage),
            0x26 => Ok(FrameType::OnlineUsersList),
            _ => Err("Invalid frame type"),
        }
    }
}

impl FrameType {
    /// Whether clients may send this frame type.
    #[must_use]
    pub fn is_request(self) -> bool {
        (self as u8) < 0x20
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Enter a group chat view: subscribe this connection to the group room.
    SubscribeGroup {
        /// Request ID for acknowledgment.
        id: u64,
        /// Group to join.
        group_id: GroupId,
    },

    /// Leave a group chat view.
    UnsubscribeGroup {
        /// Request ID for acknowledgment.
        id: u64,
        /// Group to leave.
        group_id: GroupId,
    },

    /// Send a direct message.
    SendDirect {
        /// Request ID for acknowledgment.
        id: u64,
        /// Recipient.
        receiver_id: UserId,
        /// Body.
        payload: MessagePayload,
    },

    /// Send a message to a group.
    SendGroup {
        /// Request ID for acknowledgment.
        id: u64,
        /// Recipient group.
        group_id: GroupId,
        /// Body.
        payload: MessagePayload,
    },

    /// Mark a chat read.
    MarkRead {
        /// Request ID for acknowledgment.
        id: u64,
        /// Chat to mark.
        chat: ChatKey,
    },

    /// Update the caller's profile.
    UpdateProfile {
        /// Request ID for acknowledgment.
        id: u64,
        /// Changed fields.
        fields: ProfileFields,
    },

    /// Update a group's details.
    UpdateGroup {
        /// Request ID for acknowledgment.
        id: u64,
        /// Group to update.
        group_id: GroupId,
        /// Changed fields.
        fields: GroupFields,
    },

    /// Create a group owned by the caller.
    CreateGroup {
        /// Request ID for acknowledgment.
        id: u64,
        /// Group name.
        name: String,
        /// Initial members besides the caller.
        #[serde(default)]
        members: Vec<UserId>,
    },

    /// Add a member to a group.
    AddMember {
        /// Request ID for acknowledgment.
        id: u64,
        /// Group to change.
        group_id: GroupId,
        /// User to add.
        user_id: UserId,
    },

    /// Remove a member from a group.
    RemoveMember {
        /// Request ID for acknowledgment.
        id: u64,
        /// Group to change.
        group_id: GroupId,
        /// User to remove.
        user_id: UserId,
    },

    /// Typing indicator, fire-and-forget.
    Typing {
        /// Who the caller is typing to.
        receiver_id: UserId,
        /// Started or stopped.
        typing: bool,
    },

    /// Ask for a fresh chat list snapshot.
    SyncChatList {
        /// Request ID for the reply.
        id: u64,
    },

    /// Fetch persisted messages of a chat.
    History {
        /// Request ID for the reply.
        id: u64,
        /// Which chat.
        chat: ChatKey,
        /// Maximum number of messages.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<u32>,
    },

    /// List users currently online.
    OnlineUsers {
        /// Request ID for the reply.
        id: u64,
    },

    /// Keepalive ping.
    Ping {
        /// Optional timestamp.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Connection established.
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Authenticated user.
        user_id: UserId,
        /// Negotiated protocol version.
        version: Version,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Acknowledgment of a request.
    Ack {
        /// ID of the acknowledged request.
        id: u64,
        /// Identifier of the message or group the request created.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_id: Option<MessageId>,
    },

    /// Error response.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// An event delivered on a channel.
    Event {
        /// Channel the event was delivered on.
        channel: String,
        /// The event.
        event: Event,
    },

    /// Reply to [`Frame::SyncChatList`].
    ChatList {
        /// ID of the request.
        id: u64,
        /// The snapshot.
        snapshot: UnreadSnapshot,
    },

    /// Reply to [`Frame::History`].
    HistoryPage {
        /// ID of the request.
        id: u64,
        /// Which chat.
        chat: ChatKey,
        /// Messages, oldest first.
        messages: Vec<StoredMessage>,
    },

    /// Reply to [`Frame::OnlineUsers`].
    OnlineUsersList {
        /// ID of the request.
        id: u64,
        /// Users online, sorted.
        users: Vec<UserId>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::SubscribeGroup { .. } => FrameType::SubscribeGroup,
            Frame::UnsubscribeGroup { .. } => FrameType::UnsubscribeGroup,
            Frame::SendDirect { .. } => FrameType::SendDirect,
            Frame::SendGroup { .. } => FrameType::SendGroup,
            Frame::MarkRead { .. } => FrameType::MarkRead,
            Frame::UpdateProfile { .. } => FrameType::UpdateProfile,
            Frame::UpdateGroup { .. } => FrameType::UpdateGroup,
            Frame::CreateGroup { .. } => FrameType::CreateGroup,
            Frame::AddMember { .. } => FrameType::AddMember,
            Frame::RemoveMember { .. } => FrameType::RemoveMember,
            Frame::Typing { .. } => FrameType::Typing,
            Frame::SyncChatList { .. } => FrameType::SyncChatList,
            Frame::History { .. } => FrameType::History,
            Frame::OnlineUsers { .. } => FrameType::OnlineUsers,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Event { .. } => FrameType::Event,
            Frame::ChatList { .. } => FrameType::ChatList,
            Frame::HistoryPage { .. } => FrameType::HistoryPage,
            Frame::OnlineUsersList { .. } => FrameType::OnlineUsersList,
        }
    }

    /// Request ID carried by the frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::SubscribeGroup { id, .. }
            | Frame::UnsubscribeGroup { id, .. }
            | Frame::SendDirect { id, .. }
            | Frame::SendGroup { id, .. }
            | Frame::MarkRead { id, .. }
            | Frame::UpdateProfile { id, .. }
            | Frame::UpdateGroup { id, .. }
            | Frame::CreateGroup { id, .. }
            | Frame::AddMember { id, .. }
            | Frame::RemoveMember { id, .. }
            | Frame::SyncChatList { id }
            | Frame::History { id, .. }
            | Frame::OnlineUsers { id } => Some(*id),
            _ => None,
        }
    }

    /// Create a new SubscribeGroup frame.
    #[must_use]
    pub fn subscribe_group(id: u64, group_id: GroupId) -> Self {
        Frame::SubscribeGroup { id, group_id }
    }

    /// Create a new SendDirect frame with a text body.
    #[must_use]
    pub fn send_direct(id: u64, receiver_id: UserId, text: impl Into<String>) -> Self {
        Frame::SendDirect {
            id,
            receiver_id,
            payload: MessagePayload::text(text),
        }
    }

    /// Create a new SendGroup frame with a text body.
    #[must_use]
    pub fn send_group(id: u64, group_id: GroupId, text: impl Into<String>) -> Self {
        Frame::SendGroup {
            id,
            group_id,
            payload: MessagePayload::text(text),
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack {
            id,
            created_id: None,
        }
    }

    /// Create a new Ack frame naming the created message or group.
    #[must_use]
    pub fn ack_created(id: u64, created_id: MessageId) -> Self {
        Frame::Ack {
            id,
            created_id: Some(created_id),
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(channel: impl Into<String>, event: Event) -> Self {
        Frame::Event {
            channel: channel.into(),
            event,
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        user_id: UserId,
        version: Version,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            user_id,
            version,
            heartbeat,
        }
    }
}
