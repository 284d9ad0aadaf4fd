//! Identifier types shared by every Tether component.
//!
//! Platform identifiers ([`UserId`], [`ServerId`], [`MessageId`]) are thin
//! newtypes over the chat platform's numeric snowflakes.  The two keys that
//! Tether itself owns are:
//!
//! - [`ConversationKey`]: `"{user}:{server}"`, identifying one logical
//!   conversation stream (the server part is empty for direct messages).
//! - [`InstanceId`]: an opaque token minted the first time an instance is
//!   created, threaded through follow-up events to find it again.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Returns the raw numeric id.
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

snowflake! {
    /// A chat-platform user id.
    UserId
}

snowflake! {
    /// A chat-platform server (guild) id.
    ServerId
}

snowflake! {
    /// A chat-platform message id, used to correlate UI components.
    MessageId
}

// =============================================================================
// ConversationKey
// =============================================================================

/// Identifies one logical conversation stream: a user, optionally inside a
/// server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationKey(Arc<str>);

impl ConversationKey {
    /// Builds the key for `user` in `server` (`None` for direct messages).
    pub fn new(user: UserId, server: Option<ServerId>) -> Self {
        let key = match server {
            Some(server) => format!("{user}:{server}"),
            None => format!("{user}:"),
        };
        Self(key.into())
    }

    /// Wraps a pre-formatted key.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// InstanceId
// =============================================================================

/// Opaque, globally unique identifier of a scoped handler instance.
///
/// Ids are random v4 UUIDs in their 32-character simple form, so they fit in
/// component custom ids.  The stateless path hands out [`InstanceId::empty`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(Arc<str>);

impl InstanceId {
    /// Mints a new, never-before-seen id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string().into())
    }

    /// The id carried by unregistered, stateless instances.
    pub fn empty() -> Self {
        Self(Arc::from(""))
    }

    /// Wraps an id received back from the platform (e.g. parsed out of a
    /// component custom id).
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({:?})", &*self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
