//! Auto-follow policy for a scrolling transcript view.
//!
//! The view keeps itself pinned to the newest content only while the reader
//! is already at (or near) the bottom. Scrolling up to reread pauses the
//! follow; scrolling back down resumes it. [`TranscriptFollower`] pairs the
//! policy with a transcript subscription so that every mutation comes with
//! its scroll decision.

use tokio::sync::watch;

use crate::chat::transcript::{Transcript, TranscriptHandle};

/// Distance from the bottom, in pixels, that still counts as "at the bottom".
pub const DEFAULT_FOLLOW_THRESHOLD: f64 = 40.0;

/// Scroll state of a transcript view.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    threshold: f64,
    follow: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self::new(DEFAULT_FOLLOW_THRESHOLD)
    }
}

impl Viewport {
    /// Create a viewport that starts out following.
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self {
            threshold,
            follow: true,
        }
    }

    /// Record a scroll position.
    pub fn on_scroll(&mut self, scroll_top: f64, client_height: f64, scroll_height: f64) {
        let follow = scroll_top + client_height >= scroll_height - self.threshold;
        if follow != self.follow {
            tracing::trace!(follow, "auto-follow changed");
        }
        self.follow = follow;
    }

    /// Whether new content should scroll the view to the bottom.
    #[must_use]
    pub const fn should_follow(&self) -> bool {
        self.follow
    }
}

/// Transcript subscription that decides, for each mutation, whether the
/// view should jump to the newest content.
#[derive(Debug)]
pub struct TranscriptFollower {
    rx: watch::Receiver<Transcript>,
    viewport: Viewport,
}

impl TranscriptFollower {
    /// Start following `transcript` from its current state.
    #[must_use]
    pub fn new(transcript: &TranscriptHandle, viewport: Viewport) -> Self {
        Self {
            rx: transcript.subscribe(),
            viewport,
        }
    }

    /// Scroll state, for the view to record scroll positions into.
    pub const fn viewport_mut(&mut self) -> &mut Viewport {
        &mut self.viewport
    }

    /// Wait for the next mutation.
    ///
    /// # Returns
    /// Whether the view should scroll to the bottom once the change is
    /// rendered, sampled from the scroll position before it was rendered.
    /// `None` once the transcript is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(self.viewport.should_follow())
    }

    /// Read the latest state and mark it as seen.
    pub fn read<R>(&mut self, f: impl FnOnce(&Transcript) -> R) -> R {
        f(&self.rx.borrow_and_update())
    }
}
