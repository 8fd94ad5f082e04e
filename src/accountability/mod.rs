//! Accountability fault detection.
//!
//! A worker scans the message store once heights fall out of the revisit
//! window and turns protocol violations into proofs a slashing contract can
//! replay. Complete evidence yields a Misbehaviour, incomplete evidence an
//! Accusation the accused must answer with an Innocence proof within the
//! window. Every constructed proof is re-checked against its own rule
//! predicate before it leaves the node, so detection and on-chain
//! verification cannot disagree.

pub mod proof;
pub mod submission;

pub use proof::{decode_proof, encode_proof, Proof, ProofError, ProofType, Rule};
pub use submission::{EvidencePool, SubmitError, Submitter};

use crate::config::AccountabilitySection;
use crate::consensus::backend::Backend;
use crate::consensus::committee::Committee;
use crate::consensus::messages::{
    ConsensusMsg, Message, MSG_LIGHT_PROPOSAL, MSG_PRECOMMIT, MSG_PREVOTE, MSG_PROPOSAL,
};
use crate::consensus::msg_store::MsgStore;
use crate::crypto::Verifier;
use crate::metrics::metrics;
use crate::types::{Address, Hash32, Height, Round};
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AccountabilityError {
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error("expected an accusation")]
    UnexpectedType,
    #[error("accusation rate limit exceeded")]
    RateLimited,
    #[error("proof failed verification")]
    BadProof,
}

impl AccountabilityError {
    /// Senders of garbage get penalised; rate-limited peers get disconnected
    /// by the caller either way.
    pub fn penalise_sender(&self) -> bool {
        matches!(
            self,
            AccountabilityError::Proof(_)
                | AccountabilityError::UnexpectedType
                | AccountabilityError::BadProof
        )
    }
}

pub struct FaultDetector<B: Backend, V: Verifier> {
    store: Arc<MsgStore>,
    backend: Arc<B>,
    address: Address,
    cfg: AccountabilitySection,
    /// Already-emitted (offender, rule, height) triples.
    ledger: HashSet<(Address, Rule, Height)>,
    /// Off-chain accusations seen per (peer, height).
    accusation_counts: HashMap<(Address, Height), u32>,
    last_scanned: Height,
    proofs_tx: mpsc::UnboundedSender<Proof>,
    _v: PhantomData<V>,
}

impl<B: Backend, V: Verifier> FaultDetector<B, V> {
    pub fn new(
        cfg: AccountabilitySection,
        backend: Arc<B>,
        store: Arc<MsgStore>,
        proofs_tx: mpsc::UnboundedSender<Proof>,
    ) -> Self {
        let address = backend.address();
        Self {
            store,
            backend,
            address,
            cfg,
            ledger: HashSet::new(),
            accusation_counts: HashMap::new(),
            last_scanned: 0,
            proofs_tx,
            _v: PhantomData,
        }
    }

    pub fn last_scanned(&self) -> Height {
        self.last_scanned
    }

    /// Worker loop: wakes on each finalised height announcement.
    pub async fn run(
        mut self,
        mut finalized_rx: mpsc::UnboundedReceiver<Height>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe = finalized_rx.recv() => match maybe {
                    Some(h) => self.on_finalized(h),
                    None => break,
                },
            }
        }
        info!("fault detector stopped");
    }

    /// Scan every height that is now past the revisit window, emit proofs,
    /// then prune the store behind the window.
    pub fn on_finalized(&mut self, committed: Height) {
        let upto = committed.saturating_sub(self.cfg.delta_blocks);
        if upto == 0 {
            return;
        }
        let start = (self.last_scanned + 1).max(self.store.first_height_buffered().max(1));
        for h in start..=upto {
            let committee = self.backend.committee(h);
            for p in self.scan_height(h, &committee) {
                if self.ledger.contains(&p.dedup_key()) {
                    metrics().proofs_suppressed.inc();
                    continue;
                }
                // verification gates the ledger: a forged message that fools a
                // scan must not shadow a later provable violation
                if !verify_proof::<V>(&p, &committee) {
                    warn!(
                        rule = ?p.rule,
                        offender = %p.offender().to_hex(),
                        height = h,
                        "constructed proof failed self-verification; dropped"
                    );
                    continue;
                }
                self.ledger.insert(p.dedup_key());
                metrics().proofs_emitted.inc();
                info!(
                    kind = ?p.proof_type,
                    rule = ?p.rule,
                    offender = %p.offender().to_hex(),
                    height = h,
                    "protocol violation detected"
                );
                let _ = self.proofs_tx.send(p);
            }
        }
        if upto > self.last_scanned {
            self.last_scanned = upto;
            self.store.delete_before(upto);
        }
        self.accusation_counts.retain(|(_, h), _| *h > upto);
    }

    fn scan_height(&self, height: Height, committee: &Committee) -> Vec<Proof> {
        let msgs = self.store.get(height, |_| true);
        if msgs.is_empty() {
            return Vec::new();
        }
        let mut proofs = Vec::new();
        self.scan_equivocation(&msgs, &mut proofs);
        self.scan_precommits(&msgs, committee, &mut proofs);
        self.scan_proposals(&msgs, &mut proofs);
        self.scan_prevotes(&msgs, committee, &mut proofs);
        debug!(height, found = proofs.len(), "accountability scan done");
        proofs
    }

    /// Two distinct same-kind messages from one sender at one (height, round).
    fn scan_equivocation(&self, msgs: &[Arc<Message>], out: &mut Vec<Proof>) {
        let mut slots: HashMap<(Round, u8, Address), Vec<&Arc<Message>>> = HashMap::new();
        for m in msgs {
            slots.entry((m.round(), m.code(), m.sender())).or_default().push(m);
        }
        for pair in slots.values().filter(|v| v.len() >= 2) {
            out.push(Proof {
                proof_type: ProofType::Misbehaviour,
                rule: Rule::Equivocation,
                message: Arc::clone(pair[0]),
                evidences: vec![Arc::clone(pair[1])],
            });
        }
    }

    /// PN and C1: a non-NIL precommit must be backed by a prevote quorum at
    /// its round. No supporting prevotes at all is PN; some support but below
    /// quorum is C1. Both are accusations: the accused may have seen what we
    /// did not.
    fn scan_precommits(&self, msgs: &[Arc<Message>], committee: &Committee, out: &mut Vec<Proof>) {
        for m in msgs.iter().filter(|m| m.code() == MSG_PRECOMMIT) {
            let Some(v) = m.value() else { continue };
            let support = prevotes_for(msgs, &v, m.round());
            if power_of_distinct(&support, committee) >= committee.quorum() {
                continue;
            }
            let rule = if support.is_empty() { Rule::PN } else { Rule::C1 };
            out.push(Proof {
                proof_type: ProofType::Accusation,
                rule,
                message: Arc::clone(m),
                evidences: Vec::new(),
            });
        }
    }

    /// PO: a proposer re-proposed claiming valid round vr while it had itself
    /// precommitted a different value at a later round. Both messages are
    /// signed, so this is complete evidence.
    fn scan_proposals(&self, msgs: &[Arc<Message>], out: &mut Vec<Proof>) {
        for p in msgs.iter().filter(|m| is_proposal_kind(m.code())) {
            let Some(vr) = m_valid_round(p) else { continue };
            let Some(value) = p.value() else { continue };
            let conflicting = msgs.iter().find(|m| {
                m.code() == MSG_PRECOMMIT
                    && m.sender() == p.sender()
                    && m.round() > vr
                    && m.round() < p.round()
                    && m.value().is_some()
                    && m.value() != Some(value)
            });
            if let Some(pc) = conflicting {
                out.push(Proof {
                    proof_type: ProofType::Misbehaviour,
                    rule: Rule::PO,
                    message: as_light(p),
                    evidences: vec![Arc::clone(pc)],
                });
            }
        }
    }

    /// PVN and PVO, keyed on the proposal the prevote speaks for.
    fn scan_prevotes(&self, msgs: &[Arc<Message>], committee: &Committee, out: &mut Vec<Proof>) {
        for m in msgs.iter().filter(|m| m.code() == MSG_PREVOTE) {
            let Some(v) = m.value() else { continue };
            let r = m.round();
            let Some(proposal) = msgs
                .iter()
                .find(|p| is_proposal_kind(p.code()) && p.round() == r && p.value() == Some(v))
            else {
                // nothing to classify the prevote against
                continue;
            };

            match m_valid_round(proposal) {
                None => {
                    // PVN: prevoting a new value against one's own earlier
                    // precommit, with no prevote quorum in between to justify
                    // the switch
                    let prior = msgs
                        .iter()
                        .filter(|pc| {
                            pc.code() == MSG_PRECOMMIT
                                && pc.sender() == m.sender()
                                && pc.round() < r
                                && pc.value().is_some()
                                && pc.value() != Some(v)
                        })
                        .max_by_key(|pc| pc.round());
                    if let Some(pc) = prior {
                        let justified = (pc.round() + 1..r).any(|ri| {
                            power_of_distinct(&prevotes_for(msgs, &v, ri), committee)
                                >= committee.quorum()
                        });
                        if !justified {
                            out.push(Proof {
                                proof_type: ProofType::Misbehaviour,
                                rule: Rule::PVN,
                                message: Arc::clone(m),
                                evidences: vec![Arc::clone(pc)],
                            });
                        }
                    }
                }
                Some(vr) => {
                    // PVO: the old-round proposal's claimed quorum at vr is
                    // nowhere to be seen
                    let support = prevotes_for(msgs, &v, vr);
                    if power_of_distinct(&support, committee) < committee.quorum() {
                        out.push(Proof {
                            proof_type: ProofType::Accusation,
                            rule: Rule::PVO,
                            message: Arc::clone(m),
                            evidences: vec![as_light(proposal)],
                        });
                    }
                }
            }
        }
    }

    /// Answer an accusation against the local node by exhibiting the quorum
    /// the accuser did not see. `None` when our store cannot justify us
    /// either.
    pub fn innocence_proof(&self, accusation: &Proof) -> Option<Proof> {
        let height = accusation.height();
        let committee = self.backend.committee(height);
        let m = &accusation.message;
        let v = m.value()?;
        let quorum_at = |round: Round| -> Option<Vec<Arc<Message>>> {
            let support = dedup_by_sender(self.store.get(height, |x| {
                x.code() == MSG_PREVOTE && x.round() == round && x.value() == Some(v)
            }));
            (power_of_distinct(&support, &committee) >= committee.quorum()).then_some(support)
        };

        let evidences = match accusation.rule {
            Rule::PN | Rule::C1 => quorum_at(m.round())?,
            Rule::PVO => {
                let vr = accusation.evidences.first()?.msg().valid_round()?;
                quorum_at(vr)?
            }
            Rule::PVN => {
                let from = accusation.evidences.first()?.round() + 1;
                (from..m.round()).find_map(quorum_at)?
            }
            _ => return None,
        };
        Some(Proof {
            proof_type: ProofType::Innocence,
            rule: accusation.rule,
            message: Arc::clone(m),
            evidences,
        })
    }

    /// Validate and react to an accusation gossiped by a peer. Returns the
    /// innocence proof when the accusation names the local node and the store
    /// can answer it; the proof is also queued for submission.
    pub fn handle_accusation(
        &mut self,
        from_peer: Address,
        payload: &[u8],
    ) -> Result<Option<Proof>, AccountabilityError> {
        metrics().accusations_received.inc();
        let proof = decode_proof(payload)?;
        if proof.proof_type != ProofType::Accusation {
            return Err(AccountabilityError::UnexpectedType);
        }
        let count = self
            .accusation_counts
            .entry((from_peer, proof.height()))
            .or_insert(0);
        *count += 1;
        if *count > self.cfg.max_accusations_per_height {
            return Err(AccountabilityError::RateLimited);
        }
        let committee = self.backend.committee(proof.height());
        if !verify_proof::<V>(&proof, &committee) {
            return Err(AccountabilityError::BadProof);
        }
        if proof.offender() != self.address {
            return Ok(None);
        }
        match self.innocence_proof(&proof) {
            Some(answer) => {
                info!(rule = ?answer.rule, height = answer.height(), "answering accusation");
                let _ = self.proofs_tx.send(answer.clone());
                Ok(Some(answer))
            }
            None => {
                warn!(rule = ?proof.rule, height = proof.height(), "cannot answer accusation from local store");
                Ok(None)
            }
        }
    }
}

fn is_proposal_kind(code: u8) -> bool {
    code == MSG_PROPOSAL || code == MSG_LIGHT_PROPOSAL
}

fn m_valid_round(m: &Arc<Message>) -> Option<Round> {
    m.msg().valid_round()
}

/// Evidence never ships full blocks: full proposals shrink to their light
/// form, which keeps the proposer signature verifiable.
fn as_light(m: &Arc<Message>) -> Arc<Message> {
    match m.msg() {
        ConsensusMsg::Proposal(p) => {
            Arc::new(Message::new(ConsensusMsg::LightProposal(p.to_light())))
        }
        _ => Arc::clone(m),
    }
}

fn prevotes_for(msgs: &[Arc<Message>], value: &Hash32, round: Round) -> Vec<Arc<Message>> {
    dedup_by_sender(
        msgs.iter()
            .filter(|m| m.code() == MSG_PREVOTE && m.round() == round && m.value() == Some(*value))
            .map(Arc::clone)
            .collect(),
    )
}

fn dedup_by_sender(msgs: Vec<Arc<Message>>) -> Vec<Arc<Message>> {
    let mut seen = HashSet::new();
    msgs.into_iter().filter(|m| seen.insert(m.sender())).collect()
}

fn power_of_distinct(msgs: &[Arc<Message>], committee: &Committee) -> u64 {
    let mut seen = HashSet::new();
    msgs.iter()
        .filter(|m| seen.insert(m.sender()))
        .map(|m| committee.power_of(&m.sender()))
        .sum()
}

/// Deterministic re-check of a proof against its rule predicate. Run both on
/// proofs we construct and on proofs peers send us; the slashing contract
/// runs the same checks.
pub fn verify_proof<V: Verifier>(proof: &Proof, committee: &Committee) -> bool {
    if proof.message.verify::<V>(committee).is_err() {
        return false;
    }
    if proof
        .evidences
        .iter()
        .any(|ev| ev.verify::<V>(committee).is_err())
    {
        return false;
    }
    let m = &proof.message;
    match (proof.proof_type, proof.rule) {
        (ProofType::Misbehaviour, Rule::Equivocation) => {
            let Some(ev) = proof.evidences.first() else { return false };
            ev.height() == m.height()
                && ev.round() == m.round()
                && ev.code() == m.code()
                && ev.sender() == m.sender()
                && ev.hash() != m.hash()
        }
        (ProofType::Misbehaviour, Rule::PO) => {
            let Some(ev) = proof.evidences.first() else { return false };
            let Some(vr) = m.msg().valid_round() else { return false };
            is_proposal_kind(m.code())
                && ev.code() == MSG_PRECOMMIT
                && ev.sender() == m.sender()
                && ev.round() > vr
                && ev.round() < m.round()
                && ev.value().is_some()
                && ev.value() != m.value()
        }
        (ProofType::Misbehaviour, Rule::PVN) => {
            let Some(ev) = proof.evidences.first() else { return false };
            m.code() == MSG_PREVOTE
                && m.value().is_some()
                && ev.code() == MSG_PRECOMMIT
                && ev.sender() == m.sender()
                && ev.round() < m.round()
                && ev.value().is_some()
                && ev.value() != m.value()
        }
        (ProofType::Accusation, Rule::PN | Rule::C1) => {
            m.code() == MSG_PRECOMMIT && m.value().is_some()
        }
        (ProofType::Accusation, Rule::PVO) => {
            let Some(ev) = proof.evidences.first() else { return false };
            let Some(vr) = ev.msg().valid_round() else { return false };
            m.code() == MSG_PREVOTE
                && m.value().is_some()
                && is_proposal_kind(ev.code())
                && ev.round() == m.round()
                && ev.value() == m.value()
                && vr < m.round()
        }
        (ProofType::Innocence, Rule::PN | Rule::C1 | Rule::PVO | Rule::PVN) => {
            let Some(v) = m.value() else { return false };
            let Some(first) = proof.evidences.first() else { return false };
            let round = first.round();
            let bound_ok = match proof.rule {
                Rule::PN | Rule::C1 => round == m.round(),
                _ => round < m.round(),
            };
            if !bound_ok {
                return false;
            }
            let mut seen = HashSet::new();
            let mut power = 0u64;
            for ev in &proof.evidences {
                if ev.code() != MSG_PREVOTE
                    || ev.round() != round
                    || ev.value() != Some(v)
                    || !seen.insert(ev.sender())
                {
                    return false;
                }
                power += committee.power_of(&ev.sender());
            }
            power >= committee.quorum()
        }
        _ => false,
    }
}
