//! User-facing chat session: one active conversation and at most one turn
//! in flight.
//!
//! The session owns the turn lifecycle around the [`StreamController`]:
//! input validation, lazy conversation creation, the busy indicator,
//! stopping, and cancelling a turn when the user leaves its conversation.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::backend::{ChatBackend, ChatDirectory};
use crate::chat::controller::{StreamController, TurnOutcome, TurnSettings};
use crate::chat::transcript::{TranscriptHandle, TurnSlot};
use crate::chat::types::{ChatId, ChatSummary, MessageId};
use crate::error::ChatResult;

/// Title given to conversations created implicitly by a first message.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";

struct ActiveTurn {
    cancel: CancellationToken,
    task: JoinHandle<TurnOutcome>,
    slot: TurnSlot,
}

/// A conversation view bound to a backend.
pub struct ChatSession<B: ?Sized> {
    backend: Arc<B>,
    controller: Arc<StreamController<B>>,
    active: Option<ActiveTurn>,
    busy: Arc<watch::Sender<Option<MessageId>>>,
}

impl<B> ChatSession<B>
where
    B: ChatBackend + ChatDirectory + ?Sized + 'static,
{
    /// Create a session with an empty transcript and no conversation.
    #[must_use]
    pub fn new(backend: Arc<B>, settings: TurnSettings) -> Self {
        let controller = Arc::new(StreamController::new(
            Arc::clone(&backend),
            TranscriptHandle::new(),
            settings,
        ));
        let (busy, _rx) = watch::channel(None);
        Self {
            backend,
            controller,
            active: None,
            busy: Arc::new(busy),
        }
    }

    /// Shared transcript of the active conversation.
    #[must_use]
    pub fn transcript(&self) -> &TranscriptHandle {
        self.controller.transcript()
    }

    /// Active conversation, if any.
    #[must_use]
    pub fn chat_id(&self) -> Option<ChatId> {
        self.transcript().read(|t| t.chat_id().cloned())
    }

    /// Whether a turn is in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.borrow().is_some()
    }

    /// Observe the busy indicator: the ID of the assistant message being
    /// produced, or `None` when idle.
    #[must_use]
    pub fn subscribe_busy(&self) -> watch::Receiver<Option<MessageId>> {
        self.busy.subscribe()
    }

    /// Send a user message and start streaming the answer.
    ///
    /// Blank text, or a send while another turn is in flight, is ignored and
    /// returns `Ok(None)`. Without an active conversation one is created
    /// first; if that fails nothing is appended.
    ///
    /// # Errors
    /// Returns an error if the conversation cannot be created.
    pub async fn send(&mut self, text: &str) -> ChatResult<Option<TurnSlot>> {
        if text.trim().is_empty() {
            tracing::debug!("ignoring blank message");
            return Ok(None);
        }
        if self.is_busy() {
            tracing::debug!("ignoring message while a turn is in flight");
            return Ok(None);
        }

        let chat_id = match self.chat_id() {
            Some(chat_id) => chat_id,
            None => {
                let chat = self.backend.create_chat(DEFAULT_CHAT_TITLE).await?;
                self.transcript().load(Some(chat.id.clone()), Vec::new());
                chat.id
            }
        };

        let slot = self.controller.begin(text);
        let cancel = CancellationToken::new();
        let turn = slot.assistant_id.clone();
        self.busy.send_modify(|current| *current = Some(turn));

        let task = tokio::spawn({
            let controller = Arc::clone(&self.controller);
            let busy = Arc::clone(&self.busy);
            let slot = slot.clone();
            let cancel = cancel.clone();
            let text = text.to_string();
            async move {
                let outcome = controller.drive(&chat_id, &text, &slot, cancel).await;
                busy.send_if_modified(|current| {
                    if current.as_ref() == Some(&slot.assistant_id) {
                        *current = None;
                        true
                    } else {
                        false
                    }
                });
                outcome
            }
        });

        self.active = Some(ActiveTurn {
            cancel,
            task,
            slot: slot.clone(),
        });
        Ok(Some(slot))
    }

    /// Send the most recent user message again.
    ///
    /// # Errors
    /// Returns an error if the conversation cannot be created.
    pub async fn regenerate(&mut self) -> ChatResult<Option<TurnSlot>> {
        if self.is_busy() {
            return Ok(None);
        }
        let Some(text) = self
            .transcript()
            .read(|t| t.last_user_content().map(str::to_string))
        else {
            tracing::debug!("nothing to regenerate");
            return Ok(None);
        };
        self.send(&text).await
    }

    /// Stop the turn in flight. Content received so far stays; calling this
    /// with nothing in flight, or twice, does nothing.
    pub fn stop(&self) {
        if let Some(turn) = &self.active {
            if !turn.cancel.is_cancelled() {
                tracing::info!(turn = %turn.slot.assistant_id, "stopping turn");
                turn.cancel.cancel();
            }
        }
        self.busy.send_if_modified(|current| current.take().is_some());
    }

    /// Wait for the turn in flight to resolve.
    ///
    /// Returns `None` when no turn was started since the last wait.
    pub async fn wait(&mut self) -> Option<TurnOutcome> {
        let turn = self.active.take()?;
        match turn.task.await {
            Ok(outcome) => Some(outcome),
            Err(err) => {
                tracing::error!(error = %err, "turn task failed");
                None
            }
        }
    }

    /// Switch to another conversation and load its history.
    ///
    /// The turn in flight is cancelled before the history is fetched. When
    /// the fetch fails the conversation is still opened, empty.
    ///
    /// # Errors
    /// Returns the history fetch error.
    pub async fn open_chat(&mut self, chat_id: ChatId) -> ChatResult<()> {
        self.abandon_turn();
        match self.backend.list_messages(&chat_id).await {
            Ok(history) => {
                tracing::debug!(%chat_id, messages = history.len(), "conversation loaded");
                self.transcript().load(Some(chat_id), history);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%chat_id, error = %err, "failed to load history");
                self.transcript().load(Some(chat_id), Vec::new());
                Err(err)
            }
        }
    }

    /// Create a conversation and make it active.
    ///
    /// # Errors
    /// Returns an error if the conversation cannot be created.
    pub async fn new_chat(&mut self, title: Option<&str>) -> ChatResult<ChatSummary> {
        let chat = self
            .backend
            .create_chat(title.unwrap_or(DEFAULT_CHAT_TITLE))
            .await?;
        self.abandon_turn();
        self.transcript().load(Some(chat.id.clone()), Vec::new());
        Ok(chat)
    }

    /// List conversations.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    pub async fn list_chats(&self) -> ChatResult<Vec<ChatSummary>> {
        self.backend.list_chats().await
    }

    /// Rename a conversation.
    ///
    /// # Errors
    /// Returns an error if the title is blank or the request fails.
    pub async fn rename_chat(&self, chat_id: &ChatId, title: &str) -> ChatResult<()> {
        self.backend.rename_chat(chat_id, title).await
    }

    /// Delete a conversation; deleting the active one leaves no conversation
    /// selected.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    pub async fn delete_chat(&mut self, chat_id: &ChatId) -> ChatResult<()> {
        self.backend.delete_chat(chat_id).await?;
        if self.chat_id().as_ref() == Some(chat_id) {
            self.abandon_turn();
            self.transcript().clear();
        }
        Ok(())
    }

    /// Cancel the turn in flight without waiting for it.
    fn abandon_turn(&mut self) {
        self.stop();
        self.active = None;
    }
}

impl<B: ?Sized> Drop for ChatSession<B> {
    fn drop(&mut self) {
        if let Some(turn) = &self.active {
            turn.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chat::controller::FallbackReason;
    use crate::chat::fallback::FallbackResult;
    use crate::chat::testing::{OpenBehavior, ScriptedBackend, Step};
    use crate::chat::types::{AssistantReply, Message, Role};

    fn session_for(backend: ScriptedBackend) -> (ChatSession<ScriptedBackend>, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        (
            ChatSession::new(Arc::clone(&backend), TurnSettings::default()),
            backend,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_message_is_ignored() {
        let (mut session, backend) = session_for(ScriptedBackend::default());
        assert!(session.send("   \n").await.unwrap().is_none());
        assert!(session.transcript().snapshot().is_empty());
        assert!(backend.created_chats().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_message_creates_conversation() {
        let (mut session, backend) =
            session_for(ScriptedBackend::streaming(vec![Step::Send("data: Hi\n\n")]));

        let slot = session.send("Hello").await.unwrap().unwrap();
        assert!(session.is_busy());

        let created = backend.created_chats();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].title, DEFAULT_CHAT_TITLE);
        assert_eq!(session.chat_id(), Some(created[0].id.clone()));
        assert_eq!(slot.chat_id, Some(created[0].id.clone()));

        assert_eq!(
            session.wait().await,
            Some(TurnOutcome::Completed { chunks: 1 })
        );
        assert!(!session.is_busy());
        assert!(session.wait().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_creation_appends_nothing() {
        let (mut session, _backend) = session_for(ScriptedBackend::default().failing_create());
        assert!(session.send("Hello").await.is_err());
        assert!(session.transcript().snapshot().is_empty());
        assert!(!session.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_busy_is_rejected() {
        let (mut session, backend) = session_for(ScriptedBackend::streaming(vec![
            Step::Wait(Duration::from_secs(1)),
            Step::Send("data: first\n\n"),
        ]));
        session.new_chat(None).await.unwrap();

        assert!(session.send("one").await.unwrap().is_some());
        assert!(session.send("two").await.unwrap().is_none());
        assert_eq!(session.transcript().snapshot().len(), 2);

        session.wait().await;
        assert_eq!(backend.stream_requests(), vec!["one".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_keeps_partial_answer_and_is_idempotent() {
        let (mut session, backend) = session_for(ScriptedBackend::streaming(vec![
            Step::Send("data: Rest\n\n"),
            Step::Wait(Duration::from_secs(3)),
            Step::Send("data:  well\n\n"),
        ]));
        session.new_chat(None).await.unwrap();
        session.send("Sleep tips?").await.unwrap();

        let mut rx = session.transcript().subscribe();
        rx.wait_for(|t| t.last().is_some_and(|m| m.content == "Rest"))
            .await
            .unwrap();

        session.stop();
        session.stop();
        assert!(!session.is_busy());
        assert_eq!(
            session.wait().await,
            Some(TurnOutcome::Cancelled { chunks: 1 })
        );
        session.stop();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            session.transcript().read(|t| t.last().unwrap().content.clone()),
            "Rest"
        );
        assert_eq!(backend.fallback_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_conversation_cancels_turn() {
        let history = vec![Message::user("earlier question")];
        let (mut session, backend) = session_for(
            ScriptedBackend::streaming(vec![
                Step::Send("data: partial\n\n"),
                Step::Wait(Duration::from_secs(2)),
                Step::Send("data:  late\n\n"),
            ])
            .with_history("other", history.clone()),
        );
        session.new_chat(None).await.unwrap();
        session.send("Hello").await.unwrap();

        let mut rx = session.transcript().subscribe();
        rx.wait_for(|t| t.last().is_some_and(|m| m.content == "partial"))
            .await
            .unwrap();

        session.open_chat(ChatId::new("other")).await.unwrap();
        assert!(!session.is_busy());

        tokio::time::sleep(Duration::from_secs(30)).await;
        let snapshot = session.transcript().snapshot();
        assert_eq!(snapshot.chat_id(), Some(&ChatId::new("other")));
        assert_eq!(snapshot.messages(), history.as_slice());
        assert_eq!(backend.fallback_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_regenerate_resends_last_question() {
        let (mut session, backend) = session_for(
            ScriptedBackend::streaming(vec![Step::Send("data: A\n\n")])
                .then(OpenBehavior::Fail(500))
                .with_fallback(Ok(AssistantReply {
                    content: "B".to_string(),
                    sources: vec![],
                })),
        );
        session.new_chat(None).await.unwrap();
        session.send("Question").await.unwrap();
        session.wait().await;

        session.regenerate().await.unwrap().unwrap();
        let outcome = session.wait().await.unwrap();
        assert!(matches!(
            outcome,
            TurnOutcome::FellBack {
                reason: FallbackReason::OpenFailed(_),
                result: FallbackResult::Answered,
            }
        ));

        assert_eq!(
            backend.stream_requests(),
            vec!["Question".to_string(), "Question".to_string()]
        );
        let roles: Vec<Role> = session
            .transcript()
            .read(|t| t.messages().iter().map(|m| m.role).collect());
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(
            session.transcript().read(|t| t.last().unwrap().content.clone()),
            "B"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_regenerate_without_history_does_nothing() {
        let (mut session, backend) = session_for(ScriptedBackend::default());
        assert!(session.regenerate().await.unwrap().is_none());
        assert!(backend.stream_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleting_active_conversation_clears_transcript() {
        let (mut session, backend) =
            session_for(ScriptedBackend::streaming(vec![Step::Send("data: Hi\n\n")]));
        let chat = session.new_chat(Some("Week 12")).await.unwrap();
        session.send("Hello").await.unwrap();
        session.wait().await;

        session.delete_chat(&chat.id).await.unwrap();
        assert_eq!(backend.deleted_chats(), vec![chat.id]);
        assert!(session.chat_id().is_none());
        assert!(session.transcript().snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_indicator_follows_turn() {
        let (mut session, _backend) = session_for(ScriptedBackend::streaming(vec![
            Step::Wait(Duration::from_secs(1)),
            Step::Send("data: ok\n\n"),
        ]));
        session.new_chat(None).await.unwrap();
        let mut busy = session.subscribe_busy();

        let slot = session.send("Hello").await.unwrap().unwrap();
        assert_eq!(*busy.borrow_and_update(), Some(slot.assistant_id));

        busy.changed().await.unwrap();
        assert!(busy.borrow().is_none());
    }
}
