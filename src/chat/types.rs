//! Core data model: conversations, messages, and backend payloads.

use core::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::source::Source;

/// Generate a locally unique ID for placeholder messages.
///
/// With feature `uuid_v7` enabled, this uses `Uuid::now_v7()`.
/// Otherwise it falls back to `Uuid::new_v4()`.
#[inline]
#[must_use]
fn local_uuid() -> Uuid {
    #[cfg(feature = "uuid_v7")]
    {
        Uuid::now_v7()
    }
    #[cfg(not(feature = "uuid_v7"))]
    {
        Uuid::new_v4()
    }
}

/// Declare an opaque server-issued string identifier.
macro_rules! define_string_id {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
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
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

define_string_id!(
    /// Conversation identifier, issued by the backend.
    ChatId
);

define_string_id!(
    /// Message identifier. Backend messages carry the server ID; messages
    /// created locally for an in-flight turn carry a `local-` prefixed UUID.
    MessageId
);

impl MessageId {
    /// Generate an identifier for a message created on this side.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("local-{}", local_uuid()))
    }

    /// Whether this identifier was generated locally.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with("local-")
    }
}

/// Author of a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// User input.
    User,
    /// Assistant response.
    Assistant,
}

impl Role {
    /// Stable string form used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single message in a conversation transcript.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub id: MessageId,
    /// Author.
    pub role: Role,
    /// Text content. Grows by appending while a turn is streaming.
    #[serde(default)]
    pub content: String,
    /// Citations attached to an assistant answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    /// Creation timestamp.
    #[serde(default = "Utc::now", with = "timestamp_serde")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a local user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            role: Role::User,
            content: content.into(),
            sources: None,
            created_at: Utc::now(),
        }
    }

    /// Build the empty assistant placeholder for an in-flight turn.
    #[must_use]
    pub fn assistant_placeholder() -> Self {
        Self {
            id: MessageId::local(),
            role: Role::Assistant,
            content: String::new(),
            sources: None,
            created_at: Utc::now(),
        }
    }
}

/// Timestamps are written as RFC 3339. The backend emits RFC 2822
/// (`Fri, 01 Mar 2024 10:00:00 GMT`), so both are accepted on read;
/// anything else falls back to the local clock.
mod timestamp_serde {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.as_deref().and_then(parse).unwrap_or_else(Utc::now))
    }

    pub(super) fn parse(raw: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .or_else(|_| DateTime::parse_from_rfc2822(raw))
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

/// Conversation entry in the chat list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSummary {
    /// Conversation identifier.
    pub id: ChatId,
    /// Display title.
    #[serde(default)]
    pub title: String,
}

/// Body of both message endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    /// User text.
    pub content: String,
    /// Retrieval depth.
    pub top_k: u32,
}

/// Complete answer returned by the non-streaming endpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantReply {
    /// Answer text.
    #[serde(default)]
    pub content: String,
    /// Citations, empty when the backend sent none.
    #[serde(default)]
    pub sources: Vec<Source>,
}

/// Envelope of `POST /chats/{id}/messages`.
#[derive(Debug, Deserialize)]
pub(crate) struct SendMessageResponse {
    #[serde(default)]
    pub assistant_message: Option<AssistantReply>,
}
