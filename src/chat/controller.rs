//! Runs one conversational turn end to end.
//!
//! A turn opens the streaming endpoint, feeds the body through a
//! [`FrameParser`], and applies frames to the transcript in arrival order.
//! Two single-shot stall timers bound the wait for the first token:
//!
//! - the primary timer starts before the request is sent;
//! - a `sources` or `ready` frame that arrives before any token replaces it
//!   with the longer secondary timer (armed at most once per turn).
//!
//! The first token disarms both. A stall, a failed open, or a stream that
//! ends without a single token hands the turn to the [`FallbackRequester`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::chat::backend::ChatBackend;
use crate::chat::fallback::{FallbackRequester, FallbackResult};
use crate::chat::frame::{Frame, FrameKind, FrameParser};
use crate::chat::source::parse_sources;
use crate::chat::transcript::{TranscriptHandle, TurnSlot};
use crate::chat::types::{ChatId, TurnRequest};
use crate::config::ClientConfig;

/// Per-turn knobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnSettings {
    /// Retrieval depth sent with the request.
    pub top_k: u32,
    /// Wait for any signal before falling back.
    pub primary_timeout: Duration,
    /// Wait for the first token once the backend has acknowledged.
    pub secondary_timeout: Duration,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for TurnSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            top_k: config.top_k,
            primary_timeout: config.primary_timeout,
            secondary_timeout: config.secondary_timeout,
        }
    }
}

/// Why a turn left the streaming path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    /// Nothing arrived within the primary window.
    PrimaryTimeout,
    /// The backend acknowledged but produced no token within the secondary window.
    SecondaryTimeout,
    /// The stream request failed or returned a non-success status.
    OpenFailed(String),
    /// The body failed before the first token.
    ReadFailed(String),
    /// The body ended without a single token.
    EmptyStream,
}

/// Terminal state of a turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The stream closed normally after at least one token.
    Completed {
        /// Token chunks applied.
        chunks: usize,
    },
    /// The body failed after some tokens; the partial answer is kept.
    Interrupted {
        /// Token chunks applied.
        chunks: usize,
        /// Transport error.
        error: String,
    },
    /// The non-streaming request took over.
    FellBack {
        /// What sent the turn to fallback.
        reason: FallbackReason,
        /// How the fallback ended.
        result: FallbackResult,
    },
    /// Stopped by the user; whatever arrived before stays.
    Cancelled {
        /// Token chunks applied.
        chunks: usize,
    },
}

/// Which stall timer is running, with its deadline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StallTimer {
    Idle,
    Primary(Instant),
    Secondary(Instant),
}

/// Ephemeral state of one turn. Created when a send begins and dropped when
/// the turn resolves, so nothing leaks into the next turn.
#[derive(Debug)]
pub struct StreamSession {
    cancel: CancellationToken,
    has_received_chunk: bool,
    chunks: usize,
    timer: StallTimer,
}

impl StreamSession {
    /// Start a session with the primary timer running.
    #[must_use]
    pub fn new(cancel: CancellationToken, primary_timeout: Duration) -> Self {
        Self {
            cancel,
            has_received_chunk: false,
            chunks: 0,
            timer: StallTimer::Primary(Instant::now() + primary_timeout),
        }
    }

    /// Cancellation token of this turn.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether any token chunk has been applied. Never goes back to `false`.
    #[must_use]
    pub const fn has_received_chunk(&self) -> bool {
        self.has_received_chunk
    }

    /// Number of token chunks applied.
    #[must_use]
    pub const fn chunks(&self) -> usize {
        self.chunks
    }

    /// Whether the primary timer is running.
    #[must_use]
    pub const fn primary_active(&self) -> bool {
        matches!(self.timer, StallTimer::Primary(_))
    }

    /// Whether the secondary timer is running.
    #[must_use]
    pub const fn secondary_active(&self) -> bool {
        matches!(self.timer, StallTimer::Secondary(_))
    }

    /// Record a token chunk; disarms every timer.
    pub fn mark_chunk(&mut self) {
        self.has_received_chunk = true;
        self.chunks += 1;
        self.timer = StallTimer::Idle;
    }

    /// Swap the primary timer for the secondary one, unless a token already
    /// arrived or the secondary timer is already running.
    pub fn arm_secondary(&mut self, timeout: Duration) {
        if self.has_received_chunk || self.secondary_active() {
            return;
        }
        self.timer = StallTimer::Secondary(Instant::now() + timeout);
    }

    /// Stop every timer.
    pub fn clear_timers(&mut self) {
        self.timer = StallTimer::Idle;
    }

    /// Resolves when the running timer fires; never resolves when idle.
    ///
    /// The future owns a copy of the deadline, so the session stays free to
    /// be mutated while it is pending.
    pub fn stalled(&self) -> impl Future<Output = FallbackReason> + Send + use<> {
        let timer = self.timer;
        async move {
            match timer {
                StallTimer::Idle => std::future::pending().await,
                StallTimer::Primary(deadline) => {
                    sleep_until(deadline).await;
                    FallbackReason::PrimaryTimeout
                }
                StallTimer::Secondary(deadline) => {
                    sleep_until(deadline).await;
                    FallbackReason::SecondaryTimeout
                }
            }
        }
    }
}

/// How the streaming phase ended.
enum StreamEnd {
    Finished,
    Interrupted(String),
    Stalled(FallbackReason),
    Cancelled,
}

/// Drives turns against a backend, writing into one transcript.
pub struct StreamController<B: ?Sized> {
    backend: Arc<B>,
    transcript: TranscriptHandle,
    settings: TurnSettings,
}

impl<B: ChatBackend + ?Sized> StreamController<B> {
    /// Create a controller.
    #[must_use]
    pub const fn new(backend: Arc<B>, transcript: TranscriptHandle, settings: TurnSettings) -> Self {
        Self {
            backend,
            transcript,
            settings,
        }
    }

    /// Transcript this controller writes to.
    #[must_use]
    pub const fn transcript(&self) -> &TranscriptHandle {
        &self.transcript
    }

    /// Append the user message and the empty assistant placeholder.
    #[must_use]
    pub fn begin(&self, text: &str) -> TurnSlot {
        self.transcript.begin_turn(text)
    }

    /// Start and drive a turn in one call.
    pub async fn run_turn(
        &self,
        chat_id: &ChatId,
        text: &str,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let slot = self.begin(text);
        self.drive(chat_id, text, &slot, cancel).await
    }

    /// Drive a turn whose placeholder already exists until it resolves.
    pub async fn drive(
        &self,
        chat_id: &ChatId,
        text: &str,
        slot: &TurnSlot,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let request = TurnRequest {
            content: text.to_string(),
            top_k: self.settings.top_k,
        };
        let mut session = StreamSession::new(cancel, self.settings.primary_timeout);
        let turn = &slot.assistant_id;
        tracing::debug!(%chat_id, %turn, "turn started");

        let end = self.stream(chat_id, &request, slot, &mut session).await;
        session.clear_timers();

        let outcome = match end {
            StreamEnd::Finished => TurnOutcome::Completed {
                chunks: session.chunks(),
            },
            StreamEnd::Interrupted(error) => {
                tracing::warn!(%chat_id, %turn, error = %error, "stream broke after partial answer");
                TurnOutcome::Interrupted {
                    chunks: session.chunks(),
                    error,
                }
            }
            StreamEnd::Cancelled => TurnOutcome::Cancelled {
                chunks: session.chunks(),
            },
            StreamEnd::Stalled(reason) => {
                tracing::warn!(%chat_id, %turn, ?reason, "falling back to non-streaming request");
                let result = FallbackRequester::new(&*self.backend, &self.transcript)
                    .run(chat_id, &request, slot, session.cancel_token())
                    .await;
                match result {
                    FallbackResult::Cancelled => TurnOutcome::Cancelled { chunks: 0 },
                    result => TurnOutcome::FellBack { reason, result },
                }
            }
        };

        tracing::info!(%chat_id, %turn, ?outcome, "turn resolved");
        outcome
    }

    async fn stream(
        &self,
        chat_id: &ChatId,
        request: &TurnRequest,
        slot: &TurnSlot,
        session: &mut StreamSession,
    ) -> StreamEnd {
        let cancel = session.cancel_token().clone();

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return StreamEnd::Cancelled,
            res = self.backend.open_stream(chat_id, request) => res,
            reason = session.stalled() => return StreamEnd::Stalled(reason),
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(err) => return StreamEnd::Stalled(FallbackReason::OpenFailed(err.to_string())),
        };

        let mut parser = FrameParser::new();
        loop {
            // Cancellation is checked before each read and frames win ties
            // against the timer, so a timer can never fire on a frame that
            // has already arrived.
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return StreamEnd::Cancelled,
                next = body.next() => next,
                reason = session.stalled() => return StreamEnd::Stalled(reason),
            };

            match next {
                Some(Ok(bytes)) => {
                    for frame in parser.push_bytes(&bytes) {
                        self.apply_frame(frame, slot, session);
                    }
                }
                Some(Err(err)) if session.has_received_chunk() => {
                    return StreamEnd::Interrupted(err.to_string());
                }
                Some(Err(err)) => {
                    return StreamEnd::Stalled(FallbackReason::ReadFailed(err.to_string()));
                }
                None => break,
            }
        }

        let tail = parser.finish();
        if !tail.trim().is_empty() {
            tracing::debug!(tail = %tail, "discarding unterminated frame at end of stream");
        }

        if session.has_received_chunk() {
            StreamEnd::Finished
        } else {
            StreamEnd::Stalled(FallbackReason::EmptyStream)
        }
    }

    fn apply_frame(&self, frame: Frame, slot: &TurnSlot, session: &mut StreamSession) {
        match frame.kind() {
            FrameKind::Chunk => {
                let Some(text) = frame.data.filter(|d| !d.is_empty()) else {
                    return;
                };
                session.mark_chunk();
                self.transcript
                    .apply(slot, |t, id| t.append_content(id, &text));
            }
            FrameKind::Sources => {
                let Some(payload) = frame.data else {
                    return;
                };
                if let Some(sources) = parse_sources(&payload) {
                    tracing::debug!(count = sources.len(), "sources received");
                    self.transcript
                        .apply(slot, |t, id| t.replace_sources(id, sources));
                }
                session.arm_secondary(self.settings.secondary_timeout);
            }
            FrameKind::Ready => {
                tracing::debug!("backend acknowledged the request");
                session.arm_secondary(self.settings.secondary_timeout);
            }
            FrameKind::Done => tracing::debug!("done marker received"),
            FrameKind::Error => {
                tracing::warn!(payload = ?frame.data, "backend reported a stream error");
            }
            FrameKind::Unknown => tracing::trace!(event = ?frame.event, "ignoring unknown event"),
        }
    }
}
