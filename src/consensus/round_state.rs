use crate::types::{Hash32, Round};

/// Protocol step within a round. Ordering matters: several upon rules fire at
/// "step >= prevote".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
    Propose,
    Prevote,
    Precommit,
}

/// Per-height view of the algorithm. Mutated only on the event-loop thread.
///
/// The `line*_executed` latches make the timer-scheduling upon rules one-shot
/// per round; they reset on every round start.
#[derive(Clone, Debug)]
pub struct RoundState {
    pub round: Round,
    pub step: Step,
    pub locked_value: Option<Hash32>,
    pub locked_round: Option<Round>,
    pub valid_value: Option<Hash32>,
    pub valid_round: Option<Round>,
    /// Value of the proposal accepted for the current round, if any.
    pub proposed_block_hash: Option<Hash32>,
    pub line34_executed: bool,
    pub line36_executed: bool,
    pub line47_executed: bool,
}

impl Default for RoundState {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundState {
    pub fn new() -> Self {
        Self {
            round: 0,
            step: Step::Propose,
            locked_value: None,
            locked_round: None,
            valid_value: None,
            valid_round: None,
            proposed_block_hash: None,
            line34_executed: false,
            line36_executed: false,
            line47_executed: false,
        }
    }

    /// Enter round `round` at the current height. Locks and valid values
    /// survive round changes; per-round state does not.
    pub fn start_round(&mut self, round: Round) {
        self.round = round;
        self.step = Step::Propose;
        self.proposed_block_hash = None;
        self.line34_executed = false;
        self.line36_executed = false;
        self.line47_executed = false;
        self.assert_invariants();
    }

    /// Full reset on height transition.
    pub fn reset_for_height(&mut self) {
        *self = Self::new();
    }

    pub fn set_step(&mut self, step: Step) {
        self.step = step;
    }

    pub fn lock(&mut self, value: Hash32, round: Round) {
        self.locked_value = Some(value);
        self.locked_round = Some(round);
        self.assert_invariants();
    }

    pub fn set_valid(&mut self, value: Hash32, round: Round) {
        self.valid_value = Some(value);
        self.valid_round = Some(round);
        self.assert_invariants();
    }

    /// The structural invariants every mutation must preserve. A violation
    /// means the view variables desynchronised from the message cache, which
    /// is unrecoverable: crash and re-sync.
    fn assert_invariants(&self) {
        if self.locked_round.is_some() != self.locked_value.is_some() {
            panic!("round state invariant broken: locked_round and locked_value disagree");
        }
        if self.valid_round.is_some() != self.valid_value.is_some() {
            panic!("round state invariant broken: valid_round and valid_value disagree");
        }
        if let (Some(lr), Some(vr)) = (self.locked_round, self.valid_round) {
            if vr < lr {
                panic!("round state invariant broken: valid_round {vr} < locked_round {lr}");
            }
        }
        if self.locked_round.is_some() && self.valid_round.is_none() {
            panic!("round state invariant broken: locked without a valid value");
        }
        if let Some(lr) = self.locked_round {
            if lr > self.round {
                panic!("round state invariant broken: locked_round {lr} ahead of round {}", self.round);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_ordering() {
        assert!(Step::Propose < Step::Prevote);
        assert!(Step::Prevote < Step::Precommit);
    }

    #[test]
    fn start_round_resets_latches_keeps_locks() {
        let mut s = RoundState::new();
        s.set_valid(Hash32([1u8; 32]), 0);
        s.lock(Hash32([1u8; 32]), 0);
        s.line34_executed = true;
        s.line36_executed = true;
        s.line47_executed = true;
        s.start_round(1);
        assert_eq!(s.round, 1);
        assert_eq!(s.step, Step::Propose);
        assert!(!s.line34_executed && !s.line36_executed && !s.line47_executed);
        assert_eq!(s.locked_round, Some(0));
        assert_eq!(s.valid_value, Some(Hash32([1u8; 32])));
        assert!(s.proposed_block_hash.is_none());
    }

    #[test]
    #[should_panic(expected = "invariant broken")]
    fn locking_ahead_of_valid_round_panics() {
        let mut s = RoundState::new();
        s.start_round(2);
        s.set_valid(Hash32([1u8; 32]), 0);
        // locking at a round beyond valid_round must fail loudly
        s.lock(Hash32([1u8; 32]), 2);
    }
}
