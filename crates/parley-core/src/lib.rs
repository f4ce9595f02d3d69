//! # parley-core
//!
//! Presence and message distribution core for Parley.
//!
//! This crate tracks which connections belong to which channels and fans
//! events out to them:
//!
//! - **Connection** - Registry of live transport connections per user
//! - **Membership** - Channel subscriber sets with a reverse index
//! - **Presence** - Debounced online/offline tracking
//! - **Router** - Event to channel resolution and best-effort fan-out
//! - **Unread** - Chat list recomputation and ordering
//! - **Coordinator** - Persist, route, refresh for every inbound action
//!
//! Durable state lives behind the [`ChatStore`] trait; [`MemoryStore`] is an
//! in-process implementation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Coordinator │────▶│   Router    │────▶│ Membership  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!    │      │                ▲                   │
//!    │      ▼                │                   ▼
//!    │  ┌─────────────┐      │            ┌─────────────┐
//!    │  │   Unread    │──────┘            │  Registry   │
//!    │  └─────────────┘                   └─────────────┘
//!    ▼         │
//! ┌─────────────┐
//! │  ChatStore  │◀──── persist first, then route, then refresh
//! └─────────────┘
//! ```

pub mod channel;
mod clock;
pub mod connection;
pub mod coordinator;
pub mod membership;
pub mod memory;
pub mod presence;
pub mod router;
pub mod store;
pub mod unread;

#[cfg(test)]
pub(crate) mod testing;

pub use channel::ChannelId;
pub use clock::now_millis;
pub use connection::{
    outbound_channel, Binding, Connection, ConnectionId, ConnectionRegistry, Outbound,
    OutboundReceiver, RegistryStats,
};
pub use coordinator::{
    ActionReport, SessionConfig, SessionCoordinator, SessionError, DEFAULT_HISTORY_LIMIT,
    MAX_HISTORY_LIMIT,
};
pub use membership::{ChannelMembership, MembershipError, MembershipStats};
pub use memory::MemoryStore;
pub use presence::PresenceTracker;
pub use router::{targets, DeliveryReport, EventRouter};
pub use store::{ChatStore, NewMessage, StoreError};
pub use unread::{build_snapshot, order_chats, UnreadReconciler};
