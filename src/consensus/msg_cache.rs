//! Per-height cache of consensus messages keyed by content hash.
//!
//! Owned by the state-machine thread; never shared. The cache answers the
//! upon-rule predicates: quorum tallies over distinct senders, matching
//! proposal lookup, value validity, and the moved-on (`fail`) check.

use crate::consensus::committee::Committee;
use crate::consensus::messages::{Message, Summary, MSG_PRECOMMIT, MSG_PREVOTE, MSG_PROPOSAL};
use crate::types::{Address, Block, Hash32, Height, Round};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("message height does not match cache height")]
    HeightMismatch,
    #[error("second distinct proposal from the same proposer")]
    DuplicateProposal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validity {
    Unknown,
    Valid,
    Invalid,
}

pub struct MsgCache {
    height: Height,
    by_hash: HashMap<Hash32, Arc<Message>>,
    /// Proposed blocks by value hash.
    value_blocks: HashMap<Hash32, Block>,
    /// Verification outcome per value hash; set exactly once.
    validity: HashMap<Hash32, Validity>,
    /// First proposal message hash seen per (round, proposer).
    proposals: HashMap<(Round, Address), Hash32>,
}

impl MsgCache {
    pub fn new(height: Height) -> Self {
        Self {
            height,
            by_hash: HashMap::new(),
            value_blocks: HashMap::new(),
            validity: HashMap::new(),
            proposals: HashMap::new(),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn contains(&self, hash: &Hash32) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn message(&self, hash: &Hash32) -> Option<&Arc<Message>> {
        self.by_hash.get(hash)
    }

    /// Index a message. A second, non-identical proposal from the same
    /// proposer at the same round is rejected; the caller keeps it in the
    /// message store anyway, where it is equivocation evidence.
    pub fn add_message(&mut self, msg: Arc<Message>) -> Result<(), CacheError> {
        if msg.height() != self.height {
            return Err(CacheError::HeightMismatch);
        }
        if msg.code() == MSG_PROPOSAL {
            let key = (msg.round(), msg.sender());
            match self.proposals.get(&key) {
                Some(existing) if *existing != msg.hash() => {
                    return Err(CacheError::DuplicateProposal);
                }
                _ => {
                    self.proposals.insert(key, msg.hash());
                }
            }
        }
        self.by_hash.insert(msg.hash(), msg);
        Ok(())
    }

    pub fn add_value(&mut self, block: Block) {
        self.value_blocks.insert(block.id(), block);
    }

    pub fn value(&self, hash: &Hash32) -> Option<&Block> {
        self.value_blocks.get(hash)
    }

    pub fn validity(&self, value: &Hash32) -> Validity {
        self.validity.get(value).copied().unwrap_or(Validity::Unknown)
    }

    pub fn is_valid(&self, value: &Hash32) -> bool {
        self.validity(value) == Validity::Valid
    }

    pub fn set_valid(&mut self, value: Hash32) {
        self.validity.insert(value, Validity::Valid);
    }

    pub fn set_invalid(&mut self, value: Hash32) {
        self.validity.insert(value, Validity::Invalid);
    }

    /// The accepted proposal for `round`, if one is cached. At most one can
    /// be: the proposer check and the duplicate guard run before insertion.
    pub fn round_proposal(&self, round: Round) -> Option<Summary> {
        self.by_hash
            .values()
            .find(|m| m.code() == MSG_PROPOSAL && m.round() == round)
            .map(|m| m.summary())
    }

    /// The stored proposal speaking for the same (round, value) as `cm`, if
    /// any. For a proposal summary this is the summary itself (provided the
    /// proposal was accepted into the cache).
    pub fn matching_proposal(&self, cm: &Summary) -> Option<Summary> {
        let value = cm.value?;
        self.by_hash
            .values()
            .filter(|m| m.code() == MSG_PROPOSAL)
            .find(|m| m.round() == cm.round && m.value() == Some(value))
            .map(|m| m.summary())
    }

    fn power_where<F>(&self, committee: &Committee, pred: F) -> u64
    where
        F: Fn(&Message) -> bool,
    {
        let mut seen: HashSet<Address> = HashSet::new();
        let mut power = 0u64;
        for m in self.by_hash.values() {
            if pred(m) && seen.insert(m.sender()) {
                power += committee.power_of(&m.sender());
            }
        }
        power
    }

    /// Quorum of prevotes at `round` for a specific value (`Some`) or for NIL
    /// (`None`).
    pub fn prevote_quorum(
        &self,
        value: Option<&Hash32>,
        round: Round,
        committee: &Committee,
    ) -> bool {
        let target = value.copied();
        self.power_where(committee, |m| {
            m.code() == MSG_PREVOTE && m.round() == round && m.value() == target
        }) >= committee.quorum()
    }

    /// Quorum of prevotes at `round` regardless of value.
    pub fn prevote_quorum_any(&self, round: Round, committee: &Committee) -> bool {
        self.power_where(committee, |m| m.code() == MSG_PREVOTE && m.round() == round)
            >= committee.quorum()
    }

    pub fn precommit_quorum(
        &self,
        value: Option<&Hash32>,
        round: Round,
        committee: &Committee,
    ) -> bool {
        let target = value.copied();
        self.power_where(committee, |m| {
            m.code() == MSG_PRECOMMIT && m.round() == round && m.value() == target
        }) >= committee.quorum()
    }

    pub fn precommit_quorum_any(&self, round: Round, committee: &Committee) -> bool {
        self.power_where(committee, |m| m.code() == MSG_PRECOMMIT && m.round() == round)
            >= committee.quorum()
    }

    /// More than F voting power has sent messages in `round`: the network has
    /// moved past us and the engine should catch up.
    pub fn fail(&self, round: Round, committee: &Committee) -> bool {
        self.power_where(committee, |m| m.round() == round) > committee.fault_threshold()
    }
}
