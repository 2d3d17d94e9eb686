//! Assistant backend: the streaming and non-streaming message endpoints,
//! plus the chat directory calls around them.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::chat::types::{
    AssistantReply, ChatId, ChatSummary, Message, SendMessageResponse, TurnRequest,
};
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};

/// Boxed future type for backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw body of a streaming response.
pub type ByteStream = Pin<Box<dyn Stream<Item = ChatResult<Bytes>> + Send>>;

/// The two message endpoints a turn needs.
pub trait ChatBackend: Send + Sync {
    /// Open `POST /chats/{id}/messages/stream` and return its body.
    ///
    /// # Errors
    /// Returns an error if the request fails or the status is not a success.
    fn open_stream(
        &self,
        chat_id: &ChatId,
        request: &TurnRequest,
    ) -> BackendFuture<'_, ChatResult<ByteStream>>;

    /// Call `POST /chats/{id}/messages` and return the complete answer.
    ///
    /// # Errors
    /// Returns an error if the request fails, the status is not a success,
    /// or the body is not the expected JSON.
    fn send_message(
        &self,
        chat_id: &ChatId,
        request: &TurnRequest,
    ) -> BackendFuture<'_, ChatResult<AssistantReply>>;
}

/// Conversation directory: everything around a turn that touches the server.
pub trait ChatDirectory: Send + Sync {
    /// List conversations, most recently updated first.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    fn list_chats(&self) -> BackendFuture<'_, ChatResult<Vec<ChatSummary>>>;

    /// Create a conversation.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    fn create_chat(&self, title: &str) -> BackendFuture<'_, ChatResult<ChatSummary>>;

    /// Rename a conversation.
    ///
    /// # Errors
    /// Returns an error if the title is blank or the request fails.
    fn rename_chat(&self, chat_id: &ChatId, title: &str) -> BackendFuture<'_, ChatResult<()>>;

    /// Delete a conversation and its messages.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    fn delete_chat(&self, chat_id: &ChatId) -> BackendFuture<'_, ChatResult<()>>;

    /// Load a conversation's history, oldest first.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    fn list_messages(&self, chat_id: &ChatId) -> BackendFuture<'_, ChatResult<Vec<Message>>>;
}

/// `reqwest` implementation of the backend API.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    config: ClientConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
}

impl HttpBackend {
    /// Create a backend client with the given configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: ClientConfig) -> ChatResult<Self> {
        config.validate()?;
        let client = Self::build_client(&config)?;
        Ok(Self { config, client })
    }

    /// Build an HTTP client with appropriate settings.
    ///
    /// No whole-request timeout is set here: streaming bodies stay open for as
    /// long as the answer takes. Non-streaming calls set one per request.
    fn build_client(config: &ClientConfig) -> ChatResult<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        Client::builder()
            .default_headers(headers)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChatError::HttpClient(e.to_string()))
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replace the bearer token, e.g. after [`HttpBackend::login`].
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.config.token = Some(token.into());
    }

    /// Exchange credentials for a bearer token.
    ///
    /// # Errors
    /// Returns an error if the credentials are rejected or the request fails.
    pub async fn login(&self, email: &str, password: &str) -> ChatResult<String> {
        let url = self.config.endpoint("auth/login")?;
        let body = serde_json::json!({ "email": email, "password": password });
        let request = self
            .client
            .post(url)
            .timeout(self.config.request_timeout)
            .json(&body);
        let response: LoginResponse = read_json(request.send().await?).await?;
        Ok(response.access_token)
    }

    fn authorized(&self, request: RequestBuilder) -> ChatResult<RequestBuilder> {
        let token = self.config.token.as_deref().ok_or(ChatError::Unauthorized)?;
        Ok(request.bearer_auth(token))
    }
}

impl ChatBackend for HttpBackend {
    fn open_stream(
        &self,
        chat_id: &ChatId,
        request: &TurnRequest,
    ) -> BackendFuture<'_, ChatResult<ByteStream>> {
        let path = format!("chats/{chat_id}/messages/stream");
        let body = request.clone();
        Box::pin(async move {
            let url = self.config.endpoint(&path)?;
            let builder = self
                .authorized(self.client.post(url))?
                .header(ACCEPT, "text/event-stream")
                .json(&body);
            let response = check_status(builder.send().await?).await?;
            tracing::debug!(status = %response.status(), "stream opened");
            Ok(byte_stream_from(
                response.bytes_stream().map_err(ChatError::from),
            ))
        })
    }

    fn send_message(
        &self,
        chat_id: &ChatId,
        request: &TurnRequest,
    ) -> BackendFuture<'_, ChatResult<AssistantReply>> {
        let path = format!("chats/{chat_id}/messages");
        let body = request.clone();
        Box::pin(async move {
            let url = self.config.endpoint(&path)?;
            let builder = self
                .authorized(self.client.post(url))?
                .timeout(self.config.request_timeout)
                .json(&body);
            let envelope: SendMessageResponse = read_json(builder.send().await?).await?;
            Ok(envelope.assistant_message.unwrap_or_default())
        })
    }
}

impl ChatDirectory for HttpBackend {
    fn list_chats(&self) -> BackendFuture<'_, ChatResult<Vec<ChatSummary>>> {
        Box::pin(async move {
            let request = self.authorized(self.client.get(self.config.endpoint("chats")?))?;
            read_json(request.send().await?).await
        })
    }

    fn create_chat(&self, title: &str) -> BackendFuture<'_, ChatResult<ChatSummary>> {
        let body = serde_json::json!({ "title": title });
        Box::pin(async move {
            let request = self
                .authorized(self.client.post(self.config.endpoint("chats")?))?
                .json(&body);
            let chat: ChatSummary = read_json(request.send().await?).await?;
            tracing::info!(chat_id = %chat.id, "conversation created");
            Ok(chat)
        })
    }

    fn rename_chat(&self, chat_id: &ChatId, title: &str) -> BackendFuture<'_, ChatResult<()>> {
        let path = format!("chats/{chat_id}");
        let title = title.trim().to_string();
        Box::pin(async move {
            if title.is_empty() {
                return Err(ChatError::Other("title must not be empty".to_string()));
            }
            let request = self
                .authorized(self.client.put(self.config.endpoint(&path)?))?
                .json(&serde_json::json!({ "title": title }));
            check_status(request.send().await?).await.map(drop)
        })
    }

    fn delete_chat(&self, chat_id: &ChatId) -> BackendFuture<'_, ChatResult<()>> {
        let path = format!("chats/{chat_id}");
        Box::pin(async move {
            let request = self.authorized(self.client.delete(self.config.endpoint(&path)?))?;
            check_status(request.send().await?).await.map(drop)
        })
    }

    fn list_messages(&self, chat_id: &ChatId) -> BackendFuture<'_, ChatResult<Vec<Message>>> {
        let path = format!("chats/{chat_id}/messages");
        Box::pin(async move {
            let request = self.authorized(self.client.get(self.config.endpoint(&path)?))?;
            read_json(request.send().await?).await
        })
    }
}

/// Turn a non-success status into an error carrying the response body.
async fn check_status(response: Response) -> ChatResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(%status, body = %body, "backend request failed");
    Err(ChatError::from_status(status, body))
}

async fn read_json<T: DeserializeOwned>(response: Response) -> ChatResult<T> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Adapt any in-memory chunk sequence into a [`ByteStream`].
pub fn byte_stream_from<S>(chunks: S) -> ByteStream
where
    S: Stream<Item = ChatResult<Bytes>> + Send + 'static,
{
    chunks.boxed()
}
