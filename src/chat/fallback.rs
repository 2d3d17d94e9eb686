//! Single-shot, non-streaming substitute for a broken or stalled stream.

use tokio_util::sync::CancellationToken;

use crate::chat::backend::ChatBackend;
use crate::chat::transcript::{TranscriptHandle, TurnSlot};
use crate::chat::types::{ChatId, TurnRequest};
use crate::error::ChatError;

/// Prefix marking an assistant message that reports a failure.
pub const ERROR_PREFIX: &str = "[error]";

/// How a fallback attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackResult {
    /// The full answer replaced the placeholder.
    Answered,
    /// The request failed; the placeholder now shows the reason.
    Failed(String),
    /// The user stopped the turn while the request was in flight.
    Cancelled,
}

/// Render a failure reason as assistant content.
#[must_use]
pub fn error_content(reason: &str) -> String {
    format!("{ERROR_PREFIX} {reason}")
}

/// Issues the non-streaming request and writes its outcome into the turn's slot.
pub struct FallbackRequester<'a, B: ?Sized> {
    backend: &'a B,
    transcript: &'a TranscriptHandle,
}

impl<'a, B: ChatBackend + ?Sized> FallbackRequester<'a, B> {
    /// Create a requester over a backend and the transcript it writes to.
    #[must_use]
    pub const fn new(backend: &'a B, transcript: &'a TranscriptHandle) -> Self {
        Self {
            backend,
            transcript,
        }
    }

    /// Fetch the complete answer and apply it as one atomic replacement.
    ///
    /// Failures never escape: they become the visible content of the
    /// placeholder. Nothing is written after cancellation.
    pub async fn run(
        &self,
        chat_id: &ChatId,
        request: &TurnRequest,
        slot: &TurnSlot,
        cancel: &CancellationToken,
    ) -> FallbackResult {
        tracing::info!(%chat_id, "requesting full answer without streaming");

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return FallbackResult::Cancelled,
            res = self.backend.send_message(chat_id, request) => res,
        };

        match outcome {
            Ok(reply) => {
                self.transcript
                    .apply(slot, |t, id| t.apply_reply(id, reply));
                FallbackResult::Answered
            }
            Err(err) => {
                let reason = failure_reason(&err);
                tracing::warn!(%chat_id, reason = %reason, "fallback request failed");
                let content = error_content(&reason);
                self.transcript
                    .apply(slot, |t, id| t.replace_content(id, content));
                FallbackResult::Failed(reason)
            }
        }
    }
}

fn failure_reason(err: &ChatError) -> String {
    match err {
        ChatError::Status { status, .. } => format!("fallback request failed ({status})"),
        other => other.to_string(),
    }
}
