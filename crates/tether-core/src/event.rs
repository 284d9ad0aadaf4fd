//! Event kinds recognised by the scoped-instance manager.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of inbound event a [`ConversationContext`](crate::ConversationContext)
/// was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A command execution or a component/modal callback.
    Interaction,
    /// An autocomplete request sent while the user is still typing a command.
    AutoComplete,
    /// Anything else.  Reported when no context is active.
    Other,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interaction => "interaction",
            Self::AutoComplete => "auto_complete",
            Self::Other => "other",
        }
    }

    /// Returns `true` for autocomplete requests.
    pub fn is_auto_complete(self) -> bool {
        matches!(self, Self::AutoComplete)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
