//! Global sequence counter
//!
//! Every traced event takes its position in the global order from one
//! counter. Holding the lock while reading and advancing it is the only
//! cross-thread ordering point the runtime offers: consumers sort by
//! sequence number, never by file position.
//!
//! Three ranges share the 64-bit space:
//!
//! ```text
//! [1, 10^12)            ordinary events
//! [10^12, 2*10^12)      pre-images ("old values"), seq + 10^12
//! 2*10^12               invalid: the event is dropped
//! ```

use std::sync::Mutex;

/// First sequence number handed out after `init_all`
pub const FIRST_SEQUENCE: u64 = 1;

/// Offset separating pre-image records from their event
pub const OLD_VALUE_OFFSET: u64 = 1_000_000_000_000;

/// Sentinel for "tracing inactive or counter exhausted"
pub const INVALID_SEQUENCE: u64 = 2 * OLD_VALUE_OFFSET;

/// Runtime lifecycle
///
/// ```text
/// Uninitialized --init_all--> Enabled --destroy_all--> Disabled
///                     \                                   |
///                      +--> Errored --destroy_all--------+
/// Disabled --init_all--> Enabled   (module reload)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Enabled,
    /// Output could not be opened; calls are consumed but nothing is written
    Errored,
    Disabled,
}

impl Phase {
    /// Whether sequence numbers are handed out
    pub fn is_active(self) -> bool {
        matches!(self, Phase::Enabled | Phase::Errored)
    }
}

#[derive(Debug)]
struct State {
    phase: Phase,
    next: u64,
}

/// Lock-protected sequence counter and lifecycle flag
///
/// # Example
///
/// ```
/// use pmtrace::runtime::sequence::{Phase, Sequencer, INVALID_SEQUENCE};
///
/// let seq = Sequencer::new();
/// assert_eq!(seq.acquire(1), INVALID_SEQUENCE);
///
/// seq.start(Phase::Enabled);
/// assert_eq!(seq.acquire(2), 1);
/// assert_eq!(seq.acquire(1), 3);
/// ```
#[derive(Debug)]
pub struct Sequencer {
    state: Mutex<State>,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Uninitialized,
                next: FIRST_SEQUENCE,
            }),
        }
    }

    /// Reserve `count` consecutive sequence numbers and return the first
    ///
    /// Returns [`INVALID_SEQUENCE`] without advancing when tracing is not
    /// active or the reservation would leave the ordinary range.
    pub fn acquire(&self, count: u64) -> u64 {
        let Ok(mut state) = self.state.lock() else {
            return INVALID_SEQUENCE;
        };
        if !state.phase.is_active() {
            return INVALID_SEQUENCE;
        }
        match state.next.checked_add(count) {
            Some(end) if end <= OLD_VALUE_OFFSET => {
                let seq = state.next;
                state.next = end;
                seq
            }
            _ => INVALID_SEQUENCE,
        }
    }

    /// Reset the counter and enter `phase`
    pub fn start(&self, phase: Phase) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
            state.next = FIRST_SEQUENCE;
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = phase;
        }
    }

    pub fn phase(&self) -> Phase {
        self.state
            .lock()
            .map(|state| state.phase)
            .unwrap_or(Phase::Errored)
    }

    /// Next value `acquire` would return
    pub fn peek(&self) -> u64 {
        self.state
            .lock()
            .map(|state| state.next)
            .unwrap_or(INVALID_SEQUENCE)
    }

    #[cfg(test)]
    pub(crate) fn set_next(&self, next: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.next = next;
        }
    }
}

/// Sequence number carried by a pre-image record
pub fn old_value_sequence(seq: u64, shift: u64) -> u64 {
    seq + shift + OLD_VALUE_OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_returns_sentinel() {
        let seq = Sequencer::new();
        assert_eq!(seq.acquire(1), INVALID_SEQUENCE);
        seq.start(Phase::Enabled);
        seq.set_phase(Phase::Disabled);
        assert_eq!(seq.acquire(1), INVALID_SEQUENCE);
    }

    #[test]
    fn test_errored_still_sequences() {
        let seq = Sequencer::new();
        seq.start(Phase::Errored);
        assert_eq!(seq.acquire(1), FIRST_SEQUENCE);
        assert_eq!(seq.peek(), 2);
    }

    #[test]
    fn test_acquire_advances_by_count() {
        let seq = Sequencer::new();
        seq.start(Phase::Enabled);
        assert_eq!(seq.acquire(2), 1);
        assert_eq!(seq.acquire(1), 3);
        assert_eq!(seq.acquire(5), 4);
        assert_eq!(seq.peek(), 9);
    }

    #[test]
    fn test_overflow_returns_sentinel_without_advancing() {
        let seq = Sequencer::new();
        seq.start(Phase::Enabled);
        seq.set_next(OLD_VALUE_OFFSET - 1);
        assert_eq!(seq.acquire(2), INVALID_SEQUENCE);
        assert_eq!(seq.peek(), OLD_VALUE_OFFSET - 1);
        assert_eq!(seq.acquire(1), OLD_VALUE_OFFSET - 1);
        assert_eq!(seq.acquire(1), INVALID_SEQUENCE);
    }

    #[test]
    fn test_restart_resets_counter() {
        let seq = Sequencer::new();
        seq.start(Phase::Enabled);
        seq.acquire(10);
        seq.set_phase(Phase::Disabled);
        seq.start(Phase::Enabled);
        assert_eq!(seq.acquire(1), FIRST_SEQUENCE);
    }

    #[test]
    fn test_old_value_sequence() {
        assert_eq!(old_value_sequence(7, 0), 1_000_000_000_007);
        assert_eq!(old_value_sequence(7, 1), 1_000_000_000_008);
    }
}
