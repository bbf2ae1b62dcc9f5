//! Sequence clock for ordering records.
//!
//! Every record accepted by the buffer gets the next value of this clock.
//! The collector uses `(device_id, sequence)` to recognise a record it has
//! already stored, so the clock must never go backwards, including across
//! a restart that replays the journal.

use crate::Sequence;
use serde::{Deserialize, Serialize};

/// A monotonically increasing sequence generator.
///
/// The first sequence handed out is 1; 0 means "nothing yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceClock {
    /// Last sequence handed out
    last: Sequence,
}

impl SequenceClock {
    /// Create a clock that will hand out 1 next.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Create a clock resuming after `last`.
    pub fn resume_after(last: Sequence) -> Self {
        Self { last }
    }

    /// Advance the clock and return the new sequence.
    pub fn tick(&mut self) -> Sequence {
        self.last += 1;
        self.last
    }

    /// Make sure future ticks are strictly greater than `seen`.
    /// Used when replaying records from storage.
    pub fn observe(&mut self, seen: Sequence) {
        self.last = self.last.max(seen);
    }

    /// Last sequence handed out (0 if none).
    pub fn last(&self) -> Sequence {
        self.last
    }

    /// Sequence the next tick will return.
    pub fn peek_next(&self) -> Sequence {
        self.last + 1
    }
}
