//! The per-height Tendermint state machine.
//!
//! The engine is a serial event loop: decoded messages, timer expiries,
//! commit notifications and sync requests arrive on one channel and are
//! handled one at a time. Every handler is synchronous; the async surface is
//! only the `run` loop that drains the channel. Messages for other heights
//! are kept in the message store for peers and for the fault detector, and
//! replayed through the event queue when their height becomes current.

use crate::config::ConsensusSection;
use crate::consensus::backend::Backend;
use crate::consensus::codec::CodecError;
use crate::consensus::committee::Committee;
use crate::consensus::events::{CoreEvent, TimeoutEvent};
use crate::consensus::messages::{
    committed_seal_bytes, precommit_sign_bytes, prevote_sign_bytes, proposal_sign_bytes,
    ConsensusMsg, Message, Precommit, Prevote, Proposal, Summary, VerifyError, MSG_PRECOMMIT,
    MSG_PREVOTE, MSG_PROPOSAL,
};
use crate::consensus::msg_cache::{CacheError, MsgCache, Validity};
use crate::consensus::msg_store::MsgStore;
use crate::consensus::round_state::{RoundState, Step};
use crate::consensus::sign_guard::SignGuard;
use crate::consensus::timeouts::TimeoutScheduler;
use crate::crypto::{SignatureBytes, Verifier};
use crate::metrics::metrics;
use crate::types::{hash_bytes, Address, Block, BlockHeader, Hash32, Height, Round};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error(transparent)]
    Decode(#[from] CodecError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("proposal not from the round's proposer")]
    NotFromProposer,
    #[error("duplicate message")]
    Duplicate,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("message for a future height")]
    FutureHeight,
    #[error("message for a past height")]
    PastHeight,
    #[error("message for a future round")]
    FutureRound,
}

impl ConsensusError {
    /// Benign outcomes keep the node's view of the sender intact: the message
    /// was stale, already known, or simply not usable yet.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ConsensusError::Duplicate
                | ConsensusError::FutureHeight
                | ConsensusError::PastHeight
                | ConsensusError::FutureRound
                | ConsensusError::Cache(_)
        )
    }

    /// Whether a benign message is still worth relaying to peers.
    pub fn regossip(&self) -> bool {
        matches!(
            self,
            ConsensusError::FutureHeight | ConsensusError::PastHeight | ConsensusError::FutureRound
        )
    }

    /// Cryptographic failures can only come from a broken or hostile link.
    pub fn penalise_sender(&self) -> bool {
        matches!(
            self,
            ConsensusError::Decode(_)
                | ConsensusError::Verify(
                    VerifyError::BadSignature
                        | VerifyError::SignatureMismatch
                        | VerifyError::BadCommittedSeal
                )
        )
    }
}

pub struct Engine<B: Backend, V: Verifier> {
    cfg: ConsensusSection,
    backend: Arc<B>,
    address: Address,

    height: Height,
    committee: Committee,
    parent_header: BlockHeader,
    state: RoundState,
    cache: MsgCache,
    store: Arc<MsgStore>,

    timeouts: TimeoutScheduler,
    events_tx: mpsc::UnboundedSender<CoreEvent>,
    events_rx: mpsc::UnboundedReceiver<CoreEvent>,

    /// Latest sealer candidate for the current height.
    pending_block: Option<Block>,
    /// Set once we handed a decided block to the execution collaborator and
    /// are waiting for its CommitEvent.
    awaiting_commit: bool,
    proposal_sent: bool,

    guard: Option<SignGuard>,
    /// Committed heights are announced here for the fault detector.
    finalized_tx: Option<mpsc::UnboundedSender<Height>>,

    _v: PhantomData<V>,
}

impl<B: Backend, V: Verifier> Engine<B, V> {
    pub fn new(
        cfg: ConsensusSection,
        backend: Arc<B>,
        store: Arc<MsgStore>,
        finalized_tx: Option<mpsc::UnboundedSender<Height>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let address = backend.address();
        let (last_block, _) = backend.last_committed_proposal();
        let height = last_block.header.height + 1;
        let committee = backend.committee(height);
        let guard = cfg.guard_dir.as_ref().and_then(|dir| {
            match SignGuard::open(dir, &address.to_hex()) {
                Ok(g) => Some(g),
                Err(err) => {
                    warn!(%err, "signing guard unavailable; continuing without it");
                    None
                }
            }
        });
        let timeouts = TimeoutScheduler::new(cfg.timeouts.clone(), events_tx.clone());
        Self {
            cfg,
            backend,
            address,
            height,
            committee,
            parent_header: last_block.header,
            state: RoundState::new(),
            cache: MsgCache::new(height),
            store,
            timeouts,
            events_tx,
            events_rx,
            pending_block: None,
            awaiting_commit: false,
            proposal_sent: false,
            guard,
            finalized_tx,
            _v: PhantomData,
        }
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<CoreEvent> {
        self.events_tx.clone()
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.state.round
    }

    pub fn step(&self) -> Step {
        self.state.step
    }

    pub fn round_state(&self) -> &RoundState {
        &self.state
    }

    /// Serial event loop. Returns after shutdown is signalled; timers are
    /// stopped before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(addr = %self.address.to_hex(), height = self.height, "starting consensus core");
        self.start_round(0);
        self.backend.ask_sync(&self.parent_header);

        let sync_secs = self.cfg.sync_interval_secs.max(1);
        let mut sync_interval = tokio::time::interval(Duration::from_secs(sync_secs));
        sync_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sync_interval.tick().await;
        let mut last_view = (self.height, self.state.round);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe = self.events_rx.recv() => match maybe {
                    Some(ev) => self.dispatch(ev),
                    None => break,
                },
                _ = sync_interval.tick() => {
                    let view = (self.height, self.state.round);
                    // only nag the network when the view has been stuck for a
                    // whole interval
                    if view == last_view {
                        self.backend.ask_sync(&self.parent_header);
                    }
                    last_view = view;
                }
            }
        }

        self.timeouts.stop_all();
        info!(addr = %self.address.to_hex(), "consensus core stopped");
    }

    /// Drain and handle every queued event without blocking. Test harnesses
    /// drive the engine with this instead of `run`.
    pub fn pump(&mut self) {
        while let Ok(ev) = self.events_rx.try_recv() {
            self.dispatch(ev);
        }
    }

    pub fn dispatch(&mut self, ev: CoreEvent) {
        match ev {
            CoreEvent::Message { payload } => {
                let raw = payload.clone();
                match self.handle_message(payload) {
                    Ok(()) => self.backend.gossip(&self.committee, raw),
                    Err(err) if err.is_benign() => {
                        debug!(%err, "message buffered or ignored");
                        if err.regossip() {
                            self.backend.gossip(&self.committee, raw);
                        }
                    }
                    Err(err) => {
                        metrics().msgs_dropped.inc();
                        warn!(%err, penalise = err.penalise_sender(), "message dropped");
                    }
                }
            }
            CoreEvent::NewUnminedBlock(b) => self.handle_new_unmined_block(b),
            CoreEvent::Commit => self.handle_commit_event(),
            CoreEvent::Sync { addr } => self.backend.sync_peer(addr),
            CoreEvent::Timeout(t) => self.on_timeout(t),
        }
    }

    /// Enter `round` at the current height. Proposer broadcasts; everyone
    /// else arms the propose timer. Quorums already buffered for the round
    /// are re-evaluated immediately.
    pub fn start_round(&mut self, round: Round) {
        if round > self.cfg.max_round {
            warn!(height = self.height, round, "round cap reached; holding");
            return;
        }
        self.timeouts.stop_all();
        self.state.start_round(round);
        self.proposal_sent = false;
        if round > 0 {
            metrics().rounds_advanced.inc();
        }
        info!(height = self.height, round, "start round");

        if self.committee.proposer_for(self.height, round).address == self.address {
            self.send_proposal();
        } else {
            self.timeouts.schedule(Step::Propose, self.height, round);
        }

        let reentry = self.cache.round_proposal(round).unwrap_or(Summary {
            code: MSG_PREVOTE,
            height: self.height,
            round,
            value: None,
            valid_round: None,
        });
        if let Some(v) = reentry.value {
            self.state.proposed_block_hash = Some(v);
        }
        self.process_upon_rules(reentry);
    }

    /// Decode, authenticate and react to one wire payload.
    pub fn handle_message(&mut self, payload: Vec<u8>) -> Result<(), ConsensusError> {
        metrics().msgs_received.inc();
        let hash = hash_bytes(&payload);
        if self.cache.contains(&hash) {
            return Err(ConsensusError::Duplicate);
        }
        let msg = Arc::new(Message::decode(payload)?);

        // Every decodable message is kept: peers may need it for sync and the
        // fault detector may need it as evidence.
        self.store.save(Arc::clone(&msg));

        if msg.height() > self.height {
            return Err(ConsensusError::FutureHeight);
        }
        if msg.height() < self.height {
            return Err(ConsensusError::PastHeight);
        }
        self.handle_current_height_message(msg)
    }

    fn handle_current_height_message(&mut self, msg: Arc<Message>) -> Result<(), ConsensusError> {
        msg.verify::<V>(&self.committee)?;

        match msg.msg() {
            ConsensusMsg::Proposal(p) => {
                if self.committee.proposer_for(self.height, p.round).address != p.sender {
                    return Err(ConsensusError::NotFromProposer);
                }
                let value = p.block.id();
                let block = p.block.clone();
                let round = p.round;
                self.cache.add_message(Arc::clone(&msg))?;
                self.cache.add_value(block.clone());
                if round == self.state.round {
                    self.state.proposed_block_hash = Some(value);
                }
                // the value is verified exactly once, before its validity
                // flag is set; rules only ever read the flag afterwards
                if self.cache.validity(&value) == Validity::Unknown {
                    match self.backend.verify_proposal(&block) {
                        Ok(_delay) => self.cache.set_valid(value),
                        Err(err) => {
                            warn!(height = self.height, round, %err, "invalid proposal");
                            self.cache.set_invalid(value);
                        }
                    }
                }
            }
            ConsensusMsg::LightProposal(_) => {
                // evidence material relayed by the accountability layer; it
                // never drives voting
                let _ = self.cache.add_message(Arc::clone(&msg));
                return Ok(());
            }
            _ => {
                self.cache.add_message(Arc::clone(&msg))?;
            }
        }

        let cm = msg.summary();
        self.process_upon_rules(cm);
        if cm.round > self.state.round {
            return Err(ConsensusError::FutureRound);
        }
        Ok(())
    }

    /// The algorithm's upon rules, re-evaluated after every state change.
    /// Predicates read the cache; one-shot rules are latched on the round
    /// state, step transitions latch the rest.
    fn process_upon_rules(&mut self, cm: Summary) {
        let r = self.state.round;
        let h = self.height;

        // L22 + L28: react to the current round's proposal while in Propose.
        if self.state.step == Step::Propose {
            if let Some(p) = self.cache.round_proposal(r) {
                if let Some(v) = p.value {
                    match p.valid_round {
                        None => {
                            // first proposal for this round
                            let accept = self.cache.is_valid(&v)
                                && (self.state.locked_round.is_none()
                                    || self.state.locked_value == Some(v));
                            self.send_vote(MSG_PREVOTE, accept.then_some(v));
                            self.state.set_step(Step::Prevote);
                        }
                        Some(vr) if vr < r => {
                            // re-proposal justified by an old prevote quorum
                            if self.cache.prevote_quorum(Some(&v), vr, &self.committee) {
                                let unlocks = self
                                    .state
                                    .locked_round
                                    .map_or(true, |lr| lr <= vr)
                                    || self.state.locked_value == Some(v);
                                let accept = self.cache.is_valid(&v) && unlocks;
                                self.send_vote(MSG_PREVOTE, accept.then_some(v));
                                self.state.set_step(Step::Prevote);
                            }
                        }
                        Some(vr) => {
                            debug!(round = r, valid_round = vr, "proposal claims future valid round");
                        }
                    }
                }
            }
        }

        // L34: any prevote quorum at the current round arms the prevote timer.
        if self.state.step == Step::Prevote
            && !self.state.line34_executed
            && self.cache.prevote_quorum_any(r, &self.committee)
        {
            self.state.line34_executed = true;
            self.timeouts.schedule(Step::Prevote, h, r);
        }

        // L36: prevote quorum for the round's valid proposal.
        if self.state.step >= Step::Prevote && !self.state.line36_executed {
            if let Some(p) = self.cache.round_proposal(r) {
                if let Some(v) = p.value {
                    if self.cache.is_valid(&v)
                        && self.cache.prevote_quorum(Some(&v), r, &self.committee)
                    {
                        self.state.line36_executed = true;
                        self.state.set_valid(v, r);
                        if self.state.step == Step::Prevote {
                            self.state.lock(v, r);
                            self.send_vote(MSG_PRECOMMIT, Some(v));
                            self.state.set_step(Step::Precommit);
                        }
                    }
                }
            }
        }

        // L44: prevote quorum for NIL.
        if self.state.step == Step::Prevote
            && self.cache.prevote_quorum(None, r, &self.committee)
        {
            self.send_vote(MSG_PRECOMMIT, None);
            self.state.set_step(Step::Precommit);
        }

        // L47: any precommit quorum at the current round arms the precommit timer.
        if !self.state.line47_executed && self.cache.precommit_quorum_any(r, &self.committee) {
            self.state.line47_executed = true;
            self.timeouts.schedule(Step::Precommit, h, r);
        }

        // L49: a proposal plus a precommit quorum for its value at the
        // proposal's round decides, whatever our current round is.
        if !self.awaiting_commit {
            if let Some(p) = self.cache.matching_proposal(&cm) {
                if let Some(v) = p.value {
                    if self.cache.is_valid(&v)
                        && self.cache.precommit_quorum(Some(&v), p.round, &self.committee)
                    {
                        self.commit(v, p.round);
                    }
                }
            }
        }

        // L55: F+1 voices from a later round mean the network moved on.
        if cm.round > self.state.round && self.cache.fail(cm.round, &self.committee) {
            debug!(from = self.state.round, to = cm.round, "skipping ahead with the network");
            self.start_round(cm.round);
        }
    }

    fn send_proposal(&mut self) {
        if self.proposal_sent {
            return;
        }
        let h = self.height;
        let r = self.state.round;

        // re-propose the valid value when one exists, otherwise a fresh block
        let (block, valid_round) = match self.state.valid_value {
            Some(v) => match self.cache.value(&v) {
                Some(b) => (b.clone(), self.state.valid_round),
                None => panic!(
                    "round state desynchronised from message cache: valid value {} has no block",
                    v.to_hex()
                ),
            },
            None => match &self.pending_block {
                Some(b) if b.header.height == h => (b.clone(), None),
                _ => {
                    debug!(height = h, round = r, "proposer has no candidate block yet");
                    self.timeouts.schedule(Step::Propose, h, r);
                    return;
                }
            },
        };

        let value = block.id();
        if let Some(guard) = &self.guard {
            if let Err(e) = guard.try_sign(MSG_PROPOSAL, h, r, Some(value)) {
                warn!(height = h, round = r, %e, "refusing to sign proposal");
                return;
            }
        }
        let signature = self.backend.sign(&proposal_sign_bytes(h, r, valid_round, &value));
        let message = Message::new(ConsensusMsg::Proposal(Proposal {
            height: h,
            round: r,
            valid_round,
            block,
            sender: self.address,
            signature,
        }));
        self.proposal_sent = true;
        info!(height = h, round = r, value = %value.to_hex(), "broadcast proposal");
        self.backend.broadcast(&self.committee, message.payload().to_vec());
    }

    fn send_vote(&mut self, code: u8, value: Option<Hash32>) {
        let h = self.height;
        let r = self.state.round;
        if let Some(guard) = &self.guard {
            if let Err(e) = guard.try_sign(code, h, r, value) {
                warn!(code, height = h, round = r, %e, "refusing to sign vote");
                return;
            }
        }
        let msg = match code {
            MSG_PREVOTE => {
                let signature = self.backend.sign(&prevote_sign_bytes(h, r, &value));
                ConsensusMsg::Prevote(Prevote { height: h, round: r, value, sender: self.address, signature })
            }
            MSG_PRECOMMIT => {
                let signature = self.backend.sign(&precommit_sign_bytes(h, r, &value));
                let committed_seal = self.backend.sign(&committed_seal_bytes(h, r, &value));
                ConsensusMsg::Precommit(Precommit {
                    height: h,
                    round: r,
                    value,
                    committed_seal,
                    sender: self.address,
                    signature,
                })
            }
            other => panic!("send_vote called with non-vote code {other}"),
        };
        let message = Message::new(msg);
        debug!(code, height = h, round = r, nil = value.is_none(), "broadcast vote");
        self.backend.broadcast(&self.committee, message.payload().to_vec());
    }

    pub fn on_timeout(&mut self, ev: TimeoutEvent) {
        if ev.height != self.height || ev.round != self.state.round {
            debug!(?ev, height = self.height, round = self.state.round, "stale timeout ignored");
            return;
        }
        match ev.step {
            Step::Propose => {
                if self.state.step == Step::Propose {
                    self.send_vote(MSG_PREVOTE, None);
                    self.state.set_step(Step::Prevote);
                }
            }
            Step::Prevote => {
                if self.state.step == Step::Prevote {
                    self.send_vote(MSG_PRECOMMIT, None);
                    self.state.set_step(Step::Precommit);
                }
            }
            Step::Precommit => self.start_round(ev.round + 1),
        }
    }

    pub fn handle_new_unmined_block(&mut self, block: Block) {
        if block.header.height != self.height {
            debug!(
                got = block.header.height,
                at = self.height,
                "ignoring unmined block for another height"
            );
            return;
        }
        self.pending_block = Some(block);
        if self.committee.proposer_for(self.height, self.state.round).address == self.address
            && self.state.step == Step::Propose
        {
            self.send_proposal();
        }
    }

    /// Assemble the quorum certificate and hand the decided block over. The
    /// height advances only when the execution collaborator confirms with a
    /// CommitEvent, so a crash in between cannot double-apply.
    fn commit(&mut self, value: Hash32, round: Round) {
        let block = match self.cache.value(&value) {
            Some(b) => b.clone(),
            None => panic!(
                "round state desynchronised from message cache: committing value {} with no block",
                value.to_hex()
            ),
        };
        // one seal per sender; equivocators do not get two slots
        let mut seals: BTreeMap<Address, SignatureBytes> = BTreeMap::new();
        for m in self.store.get(self.height, |m| {
            m.code() == MSG_PRECOMMIT && m.round() == round && m.value() == Some(value)
        }) {
            if let ConsensusMsg::Precommit(pc) = m.msg() {
                seals.entry(pc.sender).or_insert_with(|| pc.committed_seal.clone());
            }
        }
        match self.backend.commit(&block, round, seals.into_values().collect()) {
            Ok(()) => {
                self.awaiting_commit = true;
                self.timeouts.stop_all();
                info!(height = self.height, round, value = %value.to_hex(), "block decided, awaiting apply");
            }
            Err(err) => error!(height = self.height, round, %err, "commit handover failed"),
        }
    }

    /// The execution collaborator finished applying a block: move to the next
    /// height, replay anything buffered for it, and start at round 0.
    pub fn handle_commit_event(&mut self) {
        let (block, _proposer) = self.backend.last_committed_proposal();
        let next = block.header.height + 1;
        if next <= self.height {
            debug!(committed = block.header.height, at = self.height, "stale commit event");
            return;
        }
        metrics().blocks_committed.inc();
        metrics().consensus_height.set(next as i64);
        if let Some(tx) = &self.finalized_tx {
            let _ = tx.send(block.header.height);
        }

        self.parent_header = block.header;
        self.height = next;
        self.committee = self.backend.committee(next);
        self.cache = MsgCache::new(next);
        self.state.reset_for_height();
        self.awaiting_commit = false;
        self.pending_block = None;
        self.timeouts.stop_all();

        // buffered future-height messages re-enter through the queue instead
        // of recursing into the handler
        for m in self.store.get(next, |_| true) {
            let _ = self.events_tx.send(CoreEvent::Message { payload: m.payload().to_vec() });
        }
        self.start_round(0);
    }
}
