//! In-memory backend driven by a script, for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use crate::chat::backend::{
    BackendFuture, ByteStream, ChatBackend, ChatDirectory, byte_stream_from,
};
use crate::chat::types::{AssistantReply, ChatId, ChatSummary, Message, TurnRequest};
use crate::error::{ChatError, ChatResult};

/// One step of a scripted response body.
#[derive(Clone, Debug)]
pub(crate) enum Step {
    /// Emit these bytes as one read.
    Send(&'static str),
    /// Stay silent for a while.
    Wait(Duration),
    /// Fail the read.
    Fail,
}

/// What `open_stream` does for one turn.
#[derive(Clone, Debug)]
pub(crate) enum OpenBehavior {
    Stream(Vec<Step>),
    Fail(u16),
    Hang,
}

#[derive(Default)]
pub(crate) struct ScriptedBackend {
    opens: Mutex<VecDeque<OpenBehavior>>,
    fallback: Mutex<Option<AssistantReply>>,
    fallback_calls: AtomicUsize,
    stream_requests: Mutex<Vec<String>>,
    fallback_requests: Mutex<Vec<String>>,
    chats: Mutex<Vec<ChatSummary>>,
    histories: Mutex<HashMap<String, Vec<Message>>>,
    fail_create: Mutex<bool>,
    deleted: Mutex<Vec<ChatId>>,
}

impl ScriptedBackend {
    pub(crate) fn new(open: OpenBehavior) -> Self {
        Self::default().then(open)
    }

    pub(crate) fn streaming(steps: Vec<Step>) -> Self {
        Self::new(OpenBehavior::Stream(steps))
    }

    /// Queue the behavior of the next turn.
    pub(crate) fn then(self, open: OpenBehavior) -> Self {
        self.opens.lock().unwrap().push_back(open);
        self
    }

    pub(crate) fn with_fallback(self, reply: ChatResult<AssistantReply>) -> Self {
        *self.fallback.lock().unwrap() = reply.ok();
        self
    }

    pub(crate) fn with_history(self, chat_id: &str, history: Vec<Message>) -> Self {
        self.histories
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), history);
        self
    }

    pub(crate) fn failing_create(self) -> Self {
        *self.fail_create.lock().unwrap() = true;
        self
    }

    pub(crate) fn fallback_calls(&self) -> usize {
        self.fallback_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stream_requests(&self) -> Vec<String> {
        self.stream_requests.lock().unwrap().clone()
    }

    pub(crate) fn fallback_requests(&self) -> Vec<String> {
        self.fallback_requests.lock().unwrap().clone()
    }

    pub(crate) fn created_chats(&self) -> Vec<ChatSummary> {
        self.chats.lock().unwrap().clone()
    }

    pub(crate) fn deleted_chats(&self) -> Vec<ChatId> {
        self.deleted.lock().unwrap().clone()
    }
}

fn scripted_body(steps: Vec<Step>) -> ByteStream {
    byte_stream_from(futures::stream::unfold(
        steps.into_iter(),
        |mut steps| async move {
            loop {
                match steps.next()? {
                    Step::Wait(delay) => tokio::time::sleep(delay).await,
                    Step::Send(text) => {
                        return Some((Ok(Bytes::from_static(text.as_bytes())), steps));
                    }
                    Step::Fail => {
                        return Some((Err(ChatError::Other("connection reset".to_string())), steps));
                    }
                }
            }
        },
    ))
}

impl ChatBackend for ScriptedBackend {
    fn open_stream(
        &self,
        _chat_id: &ChatId,
        request: &TurnRequest,
    ) -> BackendFuture<'_, ChatResult<ByteStream>> {
        self.stream_requests
            .lock()
            .unwrap()
            .push(request.content.clone());
        let open = self
            .opens
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(OpenBehavior::Fail(503));
        Box::pin(async move {
            match open {
                OpenBehavior::Stream(steps) => Ok(scripted_body(steps)),
                OpenBehavior::Fail(status) => Err(ChatError::Status {
                    status,
                    body: "scripted failure".to_string(),
                }),
                OpenBehavior::Hang => std::future::pending().await,
            }
        })
    }

    fn send_message(
        &self,
        _chat_id: &ChatId,
        request: &TurnRequest,
    ) -> BackendFuture<'_, ChatResult<AssistantReply>> {
        self.fallback_calls.fetch_add(1, Ordering::SeqCst);
        self.fallback_requests
            .lock()
            .unwrap()
            .push(request.content.clone());
        let reply = self.fallback.lock().unwrap().clone();
        Box::pin(async move {
            reply.ok_or(ChatError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            })
        })
    }
}

impl ChatDirectory for ScriptedBackend {
    fn list_chats(&self) -> BackendFuture<'_, ChatResult<Vec<ChatSummary>>> {
        let chats = self.created_chats();
        Box::pin(async move { Ok(chats) })
    }

    fn create_chat(&self, title: &str) -> BackendFuture<'_, ChatResult<ChatSummary>> {
        let result = if *self.fail_create.lock().unwrap() {
            Err(ChatError::Status {
                status: 500,
                body: "create failed".to_string(),
            })
        } else {
            let mut chats = self.chats.lock().unwrap();
            let chat = ChatSummary {
                id: ChatId::new(format!("chat-{}", chats.len() + 1)),
                title: title.to_string(),
            };
            chats.push(chat.clone());
            Ok(chat)
        };
        Box::pin(async move { result })
    }

    fn rename_chat(&self, chat_id: &ChatId, title: &str) -> BackendFuture<'_, ChatResult<()>> {
        let mut chats = self.chats.lock().unwrap();
        if let Some(chat) = chats.iter_mut().find(|c| &c.id == chat_id) {
            chat.title = title.to_string();
        }
        Box::pin(async { Ok(()) })
    }

    fn delete_chat(&self, chat_id: &ChatId) -> BackendFuture<'_, ChatResult<()>> {
        self.chats.lock().unwrap().retain(|c| &c.id != chat_id);
        self.deleted.lock().unwrap().push(chat_id.clone());
        Box::pin(async { Ok(()) })
    }

    fn list_messages(&self, chat_id: &ChatId) -> BackendFuture<'_, ChatResult<Vec<Message>>> {
        let history = self
            .histories
            .lock()
            .unwrap()
            .get(chat_id.as_str())
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(history) })
    }
}
