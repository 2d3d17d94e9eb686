//! Ordered message store for the active conversation.
//!
//! [`Transcript`] is plain data. [`TranscriptHandle`] shares it between the
//! streaming controller and the UI through a `watch` channel: writers mutate
//! in place, readers get notified on every effective change.
//!
//! Each conversation load bumps an epoch. A turn captures the epoch when it
//! starts and every write it makes is checked against it, so a turn that
//! outlives a conversation switch can never write into the new transcript.

use std::sync::Arc;

use tokio::sync::watch;

use crate::chat::source::Source;
use crate::chat::types::{AssistantReply, ChatId, Message, MessageId, Role};

/// Messages of one conversation, oldest first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Transcript {
    chat_id: Option<ChatId>,
    epoch: u64,
    messages: Vec<Message>,
}

impl Transcript {
    /// Conversation this transcript belongs to.
    #[must_use]
    pub const fn chat_id(&self) -> Option<&ChatId> {
        self.chat_id.as_ref()
    }

    /// Load generation; changes whenever the conversation is replaced.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// All messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the transcript holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Most recent message.
    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Look a message up by ID.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Content of the most recent user message.
    #[must_use]
    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Append a message at the end.
    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Append text to a message's content. Returns `false` if the ID is unknown.
    pub fn append_content(&mut self, id: &MessageId, text: &str) -> bool {
        self.get_mut(id).is_some_and(|m| {
            m.content.push_str(text);
            true
        })
    }

    /// Replace a message's sources wholesale.
    pub fn replace_sources(&mut self, id: &MessageId, sources: Vec<Source>) -> bool {
        self.get_mut(id).is_some_and(|m| {
            m.sources = Some(sources);
            true
        })
    }

    /// Replace a message's content wholesale.
    pub fn replace_content(&mut self, id: &MessageId, content: String) -> bool {
        self.get_mut(id).is_some_and(|m| {
            m.content = content;
            true
        })
    }

    /// Replace content and sources with a complete reply.
    pub fn apply_reply(&mut self, id: &MessageId, reply: AssistantReply) -> bool {
        self.get_mut(id).is_some_and(|m| {
            m.content = reply.content;
            m.sources = Some(reply.sources);
            true
        })
    }

    /// Replace everything with another conversation's history.
    pub fn load(&mut self, chat_id: Option<ChatId>, history: Vec<Message>) {
        self.chat_id = chat_id;
        self.messages = history;
        self.epoch = self.epoch.wrapping_add(1);
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| &m.id == id)
    }
}

/// Write access to one turn's assistant placeholder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnSlot {
    /// Epoch the turn started in.
    pub epoch: u64,
    /// Conversation the turn belongs to.
    pub chat_id: Option<ChatId>,
    /// ID of the user message.
    pub user_id: MessageId,
    /// ID of the assistant placeholder.
    pub assistant_id: MessageId,
}

/// Shared, observable transcript.
#[derive(Clone, Debug)]
pub struct TranscriptHandle {
    tx: Arc<watch::Sender<Transcript>>,
}

impl Default for TranscriptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptHandle {
    /// Create an empty transcript with no conversation.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Transcript::default());
        Self { tx: Arc::new(tx) }
    }

    /// Observe changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Transcript> {
        self.tx.subscribe()
    }

    /// Clone the current state.
    #[must_use]
    pub fn snapshot(&self) -> Transcript {
        self.tx.borrow().clone()
    }

    /// Read the current state without cloning.
    pub fn read<R>(&self, f: impl FnOnce(&Transcript) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Replace the transcript with another conversation's history.
    pub fn load(&self, chat_id: Option<ChatId>, history: Vec<Message>) {
        self.tx.send_modify(|t| t.load(chat_id, history));
    }

    /// Drop all messages and forget the conversation.
    pub fn clear(&self) {
        self.load(None, Vec::new());
    }

    /// Append the user message and an empty assistant placeholder in one step.
    #[must_use]
    pub fn begin_turn(&self, text: &str) -> TurnSlot {
        let user = Message::user(text);
        let placeholder = Message::assistant_placeholder();
        let user_id = user.id.clone();
        let assistant_id = placeholder.id.clone();
        let mut epoch = 0;
        let mut chat_id = None;
        self.tx.send_modify(|t| {
            epoch = t.epoch;
            chat_id = t.chat_id.clone();
            t.append(user);
            t.append(placeholder);
        });
        TurnSlot {
            epoch,
            chat_id,
            user_id,
            assistant_id,
        }
    }

    /// Mutate the transcript on behalf of a turn.
    ///
    /// The write is dropped, and observers are not woken, when the transcript
    /// has moved to another epoch or `f` reports no change.
    pub fn apply(
        &self,
        slot: &TurnSlot,
        f: impl FnOnce(&mut Transcript, &MessageId) -> bool,
    ) -> bool {
        self.tx.send_if_modified(|t| {
            if t.epoch != slot.epoch {
                tracing::trace!(
                    turn_epoch = slot.epoch,
                    current_epoch = t.epoch,
                    "dropping write from a stale turn"
                );
                return false;
            }
            f(t, &slot.assistant_id)
        })
    }
}
