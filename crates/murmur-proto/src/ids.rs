//! Identifier newtypes.
//!
//! Conversations, users and messages are identified by opaque strings issued
//! by the hosted backend. Wrapping them keeps the three from being mixed up
//! at call sites that take several of them.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Conversation (chat room) identifier.
    ConversationId
);

string_id!(
    /// User identifier.
    UserId
);

string_id!(
    /// Message identifier.
    MessageId
);

impl ConversationId {
    /// Realtime channel name for this conversation.
    pub fn channel_name(&self) -> String {
        format!("chat:{}", self.0)
    }
}
