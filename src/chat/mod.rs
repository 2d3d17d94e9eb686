//! Streaming chat client.
//!
//! This module is organized into:
//! - `types`: identifiers, messages, and backend payloads
//! - `source`: citation normalization
//! - `frame`: incremental event-stream parsing
//! - `transcript`: the shared, observable message store
//! - `backend`: the HTTP API behind traits
//! - `fallback`: the non-streaming substitute request
//! - `controller`: the per-turn streaming state machine
//! - `session`: turn lifecycle around one active conversation
//! - `viewport`: auto-follow policy and the transcript follower that applies it

pub mod backend;
pub mod controller;
pub mod fallback;
pub mod frame;
pub mod session;
pub mod source;
pub mod transcript;
pub mod types;
pub mod viewport;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendFuture, ByteStream, ChatBackend, ChatDirectory, HttpBackend};
pub use controller::{
    FallbackReason, StreamController, StreamSession, TurnOutcome, TurnSettings,
};
pub use fallback::{ERROR_PREFIX, FallbackRequester, FallbackResult};
pub use frame::{Frame, FrameKind, FrameParser, Utf8StreamDecoder};
pub use session::{ChatSession, DEFAULT_CHAT_TITLE};
pub use source::{Source, parse_sources};
pub use transcript::{Transcript, TranscriptHandle, TurnSlot};
pub use types::{AssistantReply, ChatId, ChatSummary, Message, MessageId, Role, TurnRequest};
pub use viewport::{DEFAULT_FOLLOW_THRESHOLD, TranscriptFollower, Viewport};
