//! Local typing-state machine with debounced stop semantics.
//!
//! The tracker is pure: it decides which signal a keystroke, deadline, or
//! submit should emit, and the engine owns the actual timers and network
//! sends. Every armed deadline carries a generation; a deadline that fires
//! after the tracker moved on is a no-op.

use shared::protocol::TypingAction;

/// What a keystroke asks the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingEmit {
    /// Emit a start signal and arm the inactivity deadline.
    Start { generation: u64 },
    /// No signal; rearm the inactivity deadline.
    Rearm { generation: u64 },
    /// Input went empty mid-burst: emit a stop signal now.
    Stop,
}

#[derive(Debug, Default)]
pub struct TypingTracker {
    typing: bool,
    generation: u64,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    /// Called on every content change with the full input text. A start is
    /// emitted exactly once per burst; a burst only ends via deadline,
    /// submit, or the input going empty, so two consecutive starts are
    /// impossible.
    pub fn input_changed(&mut self, content: &str) -> Option<TypingEmit> {
        if content.trim().is_empty() {
            if self.typing {
                self.typing = false;
                self.generation += 1;
                return Some(TypingEmit::Stop);
            }
            return None;
        }

        self.generation += 1;
        if self.typing {
            Some(TypingEmit::Rearm {
                generation: self.generation,
            })
        } else {
            self.typing = true;
            Some(TypingEmit::Start {
                generation: self.generation,
            })
        }
    }

    /// Called when an armed inactivity deadline fires. Stale generations
    /// (another keystroke rearmed, or the burst already ended) are no-ops.
    pub fn deadline_elapsed(&mut self, generation: u64) -> Option<TypingAction> {
        if self.typing && generation == self.generation {
            self.typing = false;
            Some(TypingAction::Stop)
        } else {
            None
        }
    }

    /// Explicit submit, or the conversation going away: the burst ends
    /// immediately and any pending deadline is cancelled.
    pub fn submitted(&mut self) -> Option<TypingAction> {
        if self.typing {
            self.typing = false;
            self.generation += 1;
            Some(TypingAction::Stop)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
