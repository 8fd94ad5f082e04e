//! On-chain evidence taxonomy and its wire envelope.
//!
//! A proof wraps the accountable message together with supporting evidence
//! messages. Each inner message is carried as its full consensus payload
//! (code byte included), so heterogeneous evidence lists round-trip and every
//! inner message stays independently verifiable.

use crate::consensus::codec::CodecError;
use crate::consensus::messages::Message;
use crate::types::{Address, Height};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("unknown proof type {0}")]
    InvalidType(u8),
    #[error("impossible rule code {0}")]
    InvalidRule(u8),
    #[error("malformed proof envelope")]
    Malformed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProofType {
    Misbehaviour = 0,
    Accusation = 1,
    Innocence = 2,
}

impl TryFrom<u8> for ProofType {
    type Error = ProofError;
    fn try_from(v: u8) -> Result<Self, ProofError> {
        match v {
            0 => Ok(ProofType::Misbehaviour),
            1 => Ok(ProofType::Accusation),
            2 => Ok(ProofType::Innocence),
            other => Err(ProofError::InvalidType(other)),
        }
    }
}

/// Rule identifiers of the fault-detection engine. The on-chain checker
/// replays the same predicates, so the codes are part of the protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Rule {
    /// Precommit for a value with no supporting prevotes at all.
    PN = 0,
    /// Proposer re-proposed against its own later precommit.
    PO = 1,
    /// Prevote contradicting an earlier precommit without a justifying quorum.
    PVN = 2,
    /// Prevote for an old-round proposal whose claimed quorum is missing.
    PVO = 3,
    /// Precommit without a prevote quorum at its round.
    C1 = 4,
    /// Two distinct same-kind messages at one (height, round) from one sender.
    Equivocation = 5,
}

impl TryFrom<u8> for Rule {
    type Error = ProofError;
    fn try_from(v: u8) -> Result<Self, ProofError> {
        match v {
            0 => Ok(Rule::PN),
            1 => Ok(Rule::PO),
            2 => Ok(Rule::PVN),
            3 => Ok(Rule::PVO),
            4 => Ok(Rule::C1),
            5 => Ok(Rule::Equivocation),
            other => Err(ProofError::InvalidRule(other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Proof {
    pub proof_type: ProofType,
    pub rule: Rule,
    /// The accountable message.
    pub message: Arc<Message>,
    /// Supporting messages; order is preserved by the codec.
    pub evidences: Vec<Arc<Message>>,
}

impl Proof {
    pub fn offender(&self) -> Address {
        self.message.sender()
    }

    pub fn height(&self) -> Height {
        self.message.height()
    }

    /// Ledger key for duplicate suppression.
    pub fn dedup_key(&self) -> (Address, Rule, Height) {
        (self.offender(), self.rule, self.height())
    }
}

fn put_inner(out: &mut Vec<u8>, m: &Message) {
    out.extend_from_slice(&(m.payload().len() as u32).to_le_bytes());
    out.extend_from_slice(m.payload());
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], ProofError> {
    if buf.len() - *pos < n {
        return Err(ProofError::Malformed);
    }
    let s = &buf[*pos..*pos + n];
    *pos += n;
    Ok(s)
}

fn take_inner(buf: &[u8], pos: &mut usize) -> Result<Arc<Message>, ProofError> {
    let len = u32::from_le_bytes(take(buf, pos, 4)?.try_into().unwrap()) as usize;
    let payload = take(buf, pos, len)?.to_vec();
    Ok(Arc::new(Message::decode(payload)?))
}

pub fn encode_proof(p: &Proof) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 4 + p.message.payload().len());
    out.push(p.proof_type as u8);
    out.push(p.rule as u8);
    put_inner(&mut out, &p.message);
    out.extend_from_slice(&(p.evidences.len() as u32).to_le_bytes());
    for ev in &p.evidences {
        put_inner(&mut out, ev);
    }
    out
}

pub fn decode_proof(buf: &[u8]) -> Result<Proof, ProofError> {
    let mut pos = 0usize;
    let proof_type = ProofType::try_from(take(buf, &mut pos, 1)?[0])?;
    let rule = Rule::try_from(take(buf, &mut pos, 1)?[0])?;
    let message = take_inner(buf, &mut pos)?;
    let count = u32::from_le_bytes(take(buf, &mut pos, 4)?.try_into().unwrap()) as usize;
    let mut evidences = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        evidences.push(take_inner(buf, &mut pos)?);
    }
    if pos != buf.len() {
        return Err(ProofError::Malformed);
    }
    Ok(Proof { proof_type, rule, message, evidences })
}
