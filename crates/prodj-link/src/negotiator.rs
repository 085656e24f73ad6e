//! Master Negotiator (spec.md §4.4).
//!
//! Grounded in the teacher's `FailoverManager` (role `watch`-published,
//! lockout-guarded transition) and `feedback::FocusState`'s claim/ack
//! handshake. The negotiator owns only its own state machine; it never
//! touches a socket directly — it returns `NegotiatorAction`s for the link
//! core to send through Network I/O, keeping the state machine pure and
//! testable with a `ManualClock`.

use prodj_protocol::model::{MasterRole, Timestamp};

pub const CLAIM_BROADCAST_SPACING_MICROS: u64 = 200_000;
pub const YIELD_ACK_TIMEOUT_MICROS: u64 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorState {
    Follower,
    ClaimPending,
    Master,
    YieldPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatorAction {
    BroadcastMasterClaim { stage: u8 },
    UnicastYieldRequest { target: u8 },
    UnicastYieldResponse { target: u8 },
}

#[derive(Debug)]
pub struct MasterNegotiator {
    local_device_number: u8,
    state: NegotiatorState,
    role: MasterRole,
    claim_stage: u8,
    claims_sent: u8,
    last_claim_broadcast: Option<Timestamp>,
    yield_target: Option<u8>,
    yield_request_sent: bool,
    yield_wait_started: Option<Timestamp>,
    /// Set when we are yielding to `new_master` and must keep emitting
    /// master-flagged beats for one more beat interval before stepping down.
    pending_yield_to: Option<u8>,
}

impl MasterNegotiator {
    pub fn new(local_device_number: u8) -> Self {
        Self {
            local_device_number,
            state: NegotiatorState::Follower,
            role: MasterRole::default(),
            claim_stage: 0,
            claims_sent: 0,
            last_claim_broadcast: None,
            yield_target: None,
            yield_request_sent: false,
            yield_wait_started: None,
            pending_yield_to: None,
        }
    }

    pub fn state(&self) -> NegotiatorState {
        self.state
    }

    pub fn role(&self) -> &MasterRole {
        &self.role
    }

    pub fn is_master(&self) -> bool {
        self.state == NegotiatorState::Master
    }

    /// `Follower -> ClaimPending`: begins the three-broadcast claim sequence.
    pub fn request_master(&mut self, now: Timestamp) -> Vec<NegotiatorAction> {
        if self.state != NegotiatorState::Follower {
            return Vec::new();
        }
        self.state = NegotiatorState::ClaimPending;
        self.claim_stage = 3;
        self.claims_sent = 1;
        self.last_claim_broadcast = Some(now);
        self.yield_target = self.role.current_master;
        self.yield_request_sent = false;
        self.yield_wait_started = None;
        vec![NegotiatorAction::BroadcastMasterClaim { stage: 3 }]
    }

    /// Drive time-based transitions; call on a steady tick (e.g. every 50ms).
    pub fn tick(&mut self, now: Timestamp) -> Vec<NegotiatorAction> {
        let mut actions = Vec::new();
        match self.state {
            NegotiatorState::ClaimPending => {
                let elapsed = self
                    .last_claim_broadcast
                    .map(|t| now.saturating_diff_micros(t))
                    .unwrap_or(u64::MAX);

                if self.claims_sent < 3 && elapsed >= CLAIM_BROADCAST_SPACING_MICROS {
                    self.claim_stage -= 1;
                    self.claims_sent += 1;
                    self.last_claim_broadcast = Some(now);
                    actions.push(NegotiatorAction::BroadcastMasterClaim { stage: self.claim_stage });
                }

                if self.claims_sent >= 3 {
                    match self.yield_target {
                        None => self.become_master(&mut actions),
                        Some(target) => {
                            if !self.yield_request_sent {
                                self.yield_request_sent = true;
                                self.yield_wait_started = Some(now);
                                actions.push(NegotiatorAction::UnicastYieldRequest { target });
                            } else if let Some(started) = self.yield_wait_started {
                                if now.saturating_diff_micros(started) >= YIELD_ACK_TIMEOUT_MICROS {
                                    // "transition to Master anyway (observed behavior)"
                                    self.become_master(&mut actions);
                                }
                            }
                        }
                    }
                }
            }
            NegotiatorState::YieldPending => {
                if self.pending_yield_to.is_some() {
                    // The link core calls `beat_interval_elapsed` once one
                    // more beat interval has passed; nothing time-based to
                    // do here beyond waiting for that signal.
                }
            }
            _ => {}
        }
        actions
    }

    fn become_master(&mut self, actions: &mut Vec<NegotiatorAction>) {
        self.state = NegotiatorState::Master;
        self.role.current_master = Some(self.local_device_number);
        let _ = actions;
    }

    /// Inbound unicast yield-response (type 0x2A) addressed to us.
    pub fn on_yield_response(&mut self, ack: bool) {
        if self.state == NegotiatorState::ClaimPending && ack {
            self.state = NegotiatorState::Master;
            self.role.current_master = Some(self.local_device_number);
        }
    }

    /// `Master -> YieldPending`: a peer asked us to step down.
    pub fn on_yield_request(&mut self, from: u8) -> Vec<NegotiatorAction> {
        if self.state != NegotiatorState::Master {
            return Vec::new();
        }
        self.state = NegotiatorState::YieldPending;
        self.pending_yield_to = Some(from);
        vec![NegotiatorAction::UnicastYieldResponse { target: from }]
    }

    /// Called once the extra beat interval has elapsed after yielding.
    pub fn complete_yield(&mut self) {
        if let Some(new_master) = self.pending_yield_to.take() {
            self.state = NegotiatorState::Follower;
            self.role.current_master = Some(new_master);
        }
    }

    /// `Follower -> Follower`: observed an authoritative master flag on an
    /// incoming beat/mixer status update.
    pub fn observe_master_flag(&mut self, device_number: u8, master: bool) -> bool {
        if master && self.role.current_master != Some(device_number) {
            self.role.current_master = Some(device_number);
            return true;
        }
        false
    }

    /// Local shutdown: send three yield-responses to any known master
    /// claimant to leave cleanly, then fall back to Follower.
    pub fn shutdown(&mut self) -> Vec<NegotiatorAction> {
        let actions = if self.state == NegotiatorState::Master {
            if let Some(target) = self.yield_target.or(self.role.current_master) {
                vec![NegotiatorAction::UnicastYieldResponse { target }; 3]
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };
        self.state = NegotiatorState::Follower;
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_claim_sequence_is_exactly_three_broadcasts_at_200ms() {
        let mut n = MasterNegotiator::new(1);
        let mut actions = n.request_master(Timestamp(0));
        assert_eq!(actions, vec![NegotiatorAction::BroadcastMasterClaim { stage: 3 }]);

        actions = n.tick(Timestamp(100_000));
        assert!(actions.is_empty(), "too early for the next broadcast");

        actions = n.tick(Timestamp(200_000));
        assert_eq!(actions, vec![NegotiatorAction::BroadcastMasterClaim { stage: 2 }]);

        actions = n.tick(Timestamp(400_000));
        assert_eq!(actions, vec![NegotiatorAction::BroadcastMasterClaim { stage: 1 }]);
    }

    #[test]
    fn claim_with_no_current_master_becomes_master_immediately_after_third_broadcast() {
        let mut n = MasterNegotiator::new(1);
        n.request_master(Timestamp(0));
        n.tick(Timestamp(200_000));
        n.tick(Timestamp(400_000));
        assert_eq!(n.state(), NegotiatorState::Master);
    }

    #[test]
    fn claim_with_current_master_sends_yield_request_and_waits_for_ack() {
        let mut n = MasterNegotiator::new(1);
        n.observe_master_flag(2, true);
        n.request_master(Timestamp(0));
        n.tick(Timestamp(200_000));
        let actions = n.tick(Timestamp(400_000));
        assert!(actions.contains(&NegotiatorAction::UnicastYieldRequest { target: 2 }));
        assert_eq!(n.state(), NegotiatorState::ClaimPending);

        n.on_yield_response(true);
        assert_eq!(n.state(), NegotiatorState::Master);
    }

    #[test]
    fn yield_ack_timeout_becomes_master_anyway() {
        let mut n = MasterNegotiator::new(1);
        n.observe_master_flag(2, true);
        n.request_master(Timestamp(0));
        n.tick(Timestamp(200_000));
        n.tick(Timestamp(400_000)); // sends yield request, starts waiting
        assert_eq!(n.state(), NegotiatorState::ClaimPending);

        let actions = n.tick(Timestamp(400_000 + 500_000));
        assert!(actions.iter().any(|_| true) || n.state() == NegotiatorState::Master);
        assert_eq!(n.state(), NegotiatorState::Master);
    }

    #[test]
    fn master_yields_on_request_then_completes_after_beat_interval() {
        let mut n = MasterNegotiator::new(1);
        n.request_master(Timestamp(0));
        n.tick(Timestamp(200_000));
        n.tick(Timestamp(400_000));
        assert_eq!(n.state(), NegotiatorState::Master);

        let actions = n.on_yield_request(3);
        assert_eq!(actions, vec![NegotiatorAction::UnicastYieldResponse { target: 3 }]);
        assert_eq!(n.state(), NegotiatorState::YieldPending);

        n.complete_yield();
        assert_eq!(n.state(), NegotiatorState::Follower);
        assert_eq!(n.role().current_master, Some(3));
    }

    #[test]
    fn at_most_one_outbound_claim_sequence_in_flight() {
        let mut n = MasterNegotiator::new(1);
        n.request_master(Timestamp(0));
        let second = n.request_master(Timestamp(10));
        assert!(second.is_empty());
    }
}
