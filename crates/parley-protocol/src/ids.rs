//! Identifiers shared by every Parley component.
//!
//! User identifiers are normalized once, at construction, so every map in
//! the core keys on the same canonical form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum user identifier length after normalization.
pub const MAX_USER_ID_LENGTH: usize = 256;

/// A persisted message identifier, assigned by the store.
pub type MessageId = u64;

/// Identifier parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Empty user identifier.
    #[error("User id cannot be empty")]
    EmptyUser,

    /// User identifier longer than [`MAX_USER_ID_LENGTH`].
    #[error("User id too long")]
    UserTooLong,

    /// Group identifier is not a number.
    #[error("Invalid group id: {0}")]
    InvalidGroup(String),

    /// Chat key without a known `user:` / `group:` prefix.
    #[error("Invalid chat key: {0}")]
    InvalidChatKey(String),
}

/// An authenticated user identity.
///
/// Trimmed and ASCII-lowercased so that `Alice@Example.com ` and
/// `alice@example.com` name the same user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// Create a normalized user identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty or too long.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, IdError> {
        let normalized = raw.as_ref().trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(IdError::EmptyUser);
        }
        if normalized.len() > MAX_USER_ID_LENGTH {
            return Err(IdError::UserTooLong);
        }
        Ok(Self(normalized))
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

impl FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A group chat identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl GroupId {
    /// Create a group identifier.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GroupId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|_| IdError::InvalidGroup(s.to_string()))
    }
}

/// Key of one entry in a user's chat list.
///
/// Rendered as `user:<id>` for direct chats and `group:<id>` for groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChatKey {
    /// Direct chat with another user.
    User(UserId),
    /// Group chat.
    Group(GroupId),
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatKey::User(id) => write!(f, "user:{id}"),
            ChatKey::Group(id) => write!(f, "group:{id}"),
        }
    }
}

impl FromStr for ChatKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("user", id)) => Ok(ChatKey::User(UserId::new(id)?)),
            Some(("group", id)) => Ok(ChatKey::Group(id.parse()?)),
            _ => Err(IdError::InvalidChatKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChatKey {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChatKey> for String {
    fn from(key: ChatKey) -> Self {
        key.to_string()
    }
}
