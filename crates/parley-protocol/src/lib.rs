//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat distribution core.
//!
//! This crate defines the identifiers, events and frames exchanged between
//! Parley clients and the server, along with the codecs used to put them on
//! the wire and the protocol version.
//!
//! ## Frame Types
//!
//! - `SubscribeGroup` / `UnsubscribeGroup` - Group room membership
//! - `SendDirect` / `SendGroup` - Create messages
//! - `MarkRead` / `SyncChatList` - Unread state
//! - `Event` - Server push of a routed [`Event`]
//! - `Ack` / `Error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame, GroupId};
//!
//! let frame = Frame::subscribe_group(1, GroupId::new(7));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod frames;
pub mod ids;
pub mod version;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use event::{
    Attachment, ChatSummary, Event, GroupFields, MessagePayload, MessageTarget, ProfileFields,
    StoredMessage, UnreadSnapshot,
};
pub use frames::{codes, Frame, FrameType};
pub use ids::{ChatKey, GroupId, IdError, MessageId, UserId};
pub use version::{Version, PROTOCOL_VERSION};
