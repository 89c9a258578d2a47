//! Local edit accumulation and flush heuristics.
//!
//! Turns a stream of keystroke-level text states into a bounded stream of
//! flush attempts. On every observation the buffer accumulates the growth
//! in character count and decides:
//!
//! - flush immediately when at least [`FLUSH_CHAR_THRESHOLD`] characters
//!   accumulated, or the text ends at a word boundary;
//! - otherwise (re)start a [`DEBOUNCE`] timer — any later edit restarts it.
//!
//! Independently of the char heuristic, a candidate identical to the last
//! successfully acknowledged value is never flushed at all. Timers live in
//! the client; the buffer itself is a synchronous state machine.

use std::time::Duration;

/// Accumulated character growth that triggers an immediate flush.
pub const FLUSH_CHAR_THRESHOLD: usize = 10;
/// Inactivity window before a below-threshold edit is flushed.
pub const DEBOUNCE: Duration = Duration::from_millis(500);

/// What the client should do after one local text observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushSignal {
    /// Threshold or word boundary reached: flush now.
    Immediate,
    /// Below threshold: (re)start the debounce timer.
    Debounce,
}

/// Per-document edit buffer.
#[derive(Debug, Default)]
pub struct ChangeBuffer {
    /// Latest observed text; always the flush candidate.
    pending: Option<String>,
    /// Character growth accumulated since the last flush attempt.
    pending_chars: usize,
    /// Char length of the previously observed text.
    previous_len: usize,
    /// Last value that was successfully acknowledged by the server.
    last_flushed: Option<String>,
}

impl ChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one local text state and decide how to flush it.
    pub fn observe(&mut self, text: &str) -> FlushSignal {
        let len = text.chars().count();
        let delta = len.saturating_sub(self.previous_len);
        self.previous_len = len;
        self.pending_chars += delta;
        self.pending = Some(text.to_string());

        if self.pending_chars >= FLUSH_CHAR_THRESHOLD || ends_at_word_boundary(text) {
            FlushSignal::Immediate
        } else {
            FlushSignal::Debounce
        }
    }

    /// The current flush candidate, if it differs from the last
    /// acknowledged value. Content-equality de-dup lives here,
    /// independent of the char-delta heuristic.
    pub fn candidate(&self) -> Option<&str> {
        let pending = self.pending.as_deref()?;
        if self.last_flushed.as_deref() == Some(pending) {
            return None;
        }
        Some(pending)
    }

    /// Claim the candidate for a flush attempt, resetting the char
    /// accumulator. Returns `None` when there is nothing new to send.
    pub fn take_candidate(&mut self) -> Option<String> {
        let candidate = self.candidate()?.to_string();
        self.pending_chars = 0;
        Some(candidate)
    }

    /// Record a successful acknowledgment for `content`; it becomes the
    /// de-dup baseline.
    pub fn commit(&mut self, content: &str) {
        self.last_flushed = Some(content.to_string());
    }

    /// Whether the buffer holds edits not yet acknowledged.
    pub fn has_unsynced(&self) -> bool {
        self.candidate().is_some()
    }

    pub fn pending_text(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn last_flushed(&self) -> Option<&str> {
        self.last_flushed.as_deref()
    }

    pub fn pending_chars(&self) -> usize {
        self.pending_chars
    }
}

/// True when the text ends with at least one letter followed by a single
/// trailing whitespace — the author just finished a word.
fn ends_at_word_boundary(text: &str) -> bool {
    let mut chars = text.chars().rev();
    match (chars.next(), chars.next()) {
        (Some(last), Some(prev)) => last.is_whitespace() && prev.is_alphabetic(),
        _ => false,
    }
}
