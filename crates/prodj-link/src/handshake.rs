//! Self-assignment handshake (spec.md §4.3 "Self-assignment at startup").
//!
//! Pure state machine, same separation as `negotiator.rs`: it only decides
//! when to (re)announce a candidate device number and whether the attempt
//! succeeded, leaving the actual broadcast to the caller.

use prodj_protocol::model::Timestamp;

pub const REQUEST_SPACING_MICROS: u64 = 300_000;
pub const REQUEST_COUNT: u8 = 4;
pub const MAX_ATTEMPTS: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Still announcing; caller should keep calling `tick`.
    InProgress,
    /// No conflicts observed across all four requests: commit this number.
    Committed(u8),
    /// A peer echoed our candidate; caller should start over with the next
    /// free number, up to `MAX_ATTEMPTS` total attempts.
    Conflicted,
    /// Ran out of attempts without finding a free number.
    Exhausted,
}

#[derive(Debug)]
pub struct SelfAssignment {
    candidate: u8,
    requests_sent: u8,
    last_request: Option<Timestamp>,
    attempt: u8,
    conflicted: bool,
}

impl SelfAssignment {
    pub fn new(candidate: u8) -> Self {
        Self { candidate, requests_sent: 0, last_request: None, attempt: 1, conflicted: false }
    }

    pub fn candidate(&self) -> u8 {
        self.candidate
    }

    /// Restart the handshake against a new candidate number after a
    /// conflict. Returns `Exhausted` if `MAX_ATTEMPTS` has been used up.
    pub fn retry_with(&mut self, next_candidate: u8) -> HandshakeOutcome {
        if self.attempt >= MAX_ATTEMPTS {
            return HandshakeOutcome::Exhausted;
        }
        self.attempt += 1;
        self.candidate = next_candidate;
        self.requests_sent = 0;
        self.last_request = None;
        self.conflicted = false;
        HandshakeOutcome::InProgress
    }

    /// A peer's ID-response (or a keepalive) echoed the candidate number.
    pub fn on_conflict_observed(&mut self, device_number: u8) {
        if device_number == self.candidate {
            self.conflicted = true;
        }
    }

    /// Call on a steady tick; returns `Some(candidate)` when it's time to
    /// send the next ID-request broadcast, spaced 300ms apart.
    pub fn next_broadcast(&mut self, now: Timestamp) -> Option<u8> {
        if self.requests_sent >= REQUEST_COUNT || self.conflicted {
            return None;
        }
        let due = match self.last_request {
            None => true,
            Some(last) => now.saturating_diff_micros(last) >= REQUEST_SPACING_MICROS,
        };
        if !due {
            return None;
        }
        self.requests_sent += 1;
        self.last_request = Some(now);
        Some(self.candidate)
    }

    pub fn outcome(&self) -> HandshakeOutcome {
        if self.conflicted {
            HandshakeOutcome::Conflicted
        } else if self.requests_sent >= REQUEST_COUNT {
            HandshakeOutcome::Committed(self.candidate)
        } else {
            HandshakeOutcome::InProgress
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_four_requests_spaced_300ms_then_commits() {
        let mut hs = SelfAssignment::new(2);
        assert_eq!(hs.next_broadcast(Timestamp(0)), Some(2));
        assert_eq!(hs.next_broadcast(Timestamp(100_000)), None);
        assert_eq!(hs.next_broadcast(Timestamp(300_000)), Some(2));
        assert_eq!(hs.next_broadcast(Timestamp(600_000)), Some(2));
        assert_eq!(hs.next_broadcast(Timestamp(900_000)), Some(2));
        assert_eq!(hs.outcome(), HandshakeOutcome::Committed(2));
    }

    #[test]
    fn conflict_before_final_request_aborts_commit() {
        let mut hs = SelfAssignment::new(2);
        hs.next_broadcast(Timestamp(0));
        hs.next_broadcast(Timestamp(300_000));
        hs.on_conflict_observed(2);
        assert_eq!(hs.next_broadcast(Timestamp(600_000)), None);
        assert_eq!(hs.outcome(), HandshakeOutcome::Conflicted);
    }

    #[test]
    fn retry_picks_new_candidate_and_resets_progress() {
        let mut hs = SelfAssignment::new(2);
        hs.on_conflict_observed(2);
        assert_eq!(hs.outcome(), HandshakeOutcome::Conflicted);

        let outcome = hs.retry_with(3);
        assert_eq!(outcome, HandshakeOutcome::InProgress);
        assert_eq!(hs.candidate(), 3);
        assert_eq!(hs.next_broadcast(Timestamp(0)), Some(3));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let mut hs = SelfAssignment::new(1);
        hs.retry_with(2);
        hs.retry_with(3);
        assert_eq!(hs.retry_with(4), HandshakeOutcome::Exhausted);
    }
}
