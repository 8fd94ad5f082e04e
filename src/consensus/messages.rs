//! Consensus message types and signing.
//!
//! Sign bytes use a deterministic binary format, never serde: a 4-byte domain
//! tag followed by little-endian fixed fields and raw hashes. Domain tags keep
//! the four message kinds and the committed seal from sharing a preimage.

use crate::consensus::codec;
use crate::consensus::committee::Committee;
use crate::crypto::{derive_address, SignatureBytes, Verifier};
use crate::types::{hash_bytes, Address, Block, Hash32, Height, Round};
use thiserror::Error;

pub const MSG_PROPOSAL: u8 = 0;
pub const MSG_PREVOTE: u8 = 1;
pub const MSG_PRECOMMIT: u8 = 2;
pub const MSG_LIGHT_PROPOSAL: u8 = 3;

const DOMAIN_PROPOSAL: [u8; 4] = *b"PROP";
const DOMAIN_PREVOTE: [u8; 4] = *b"PRVT";
const DOMAIN_PRECOMMIT: [u8; 4] = *b"PRCM";
const DOMAIN_SEAL: [u8; 4] = *b"SEAL";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("sender not in committee")]
    NotFromCommittee,
    #[error("declared sender does not match committee key")]
    SignatureMismatch,
    #[error("invalid message signature")]
    BadSignature,
    #[error("committed seal does not verify")]
    BadCommittedSeal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    /// `None` is the "first proposal" sentinel (the algorithm's -1).
    pub valid_round: Option<Round>,
    pub block: Block,
    pub sender: Address,
    pub signature: SignatureBytes,
}

impl Proposal {
    /// Signature-stripped view used as evidence: the full block is replaced by
    /// its hash, the proposer signature is kept so the view stays verifiable.
    pub fn to_light(&self) -> LightProposal {
        LightProposal {
            height: self.height,
            round: self.round,
            valid_round: self.valid_round,
            value: self.block.id(),
            sender: self.sender,
            signature: self.signature.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prevote {
    pub height: Height,
    pub round: Round,
    /// `None` votes NIL.
    pub value: Option<Hash32>,
    pub sender: Address,
    pub signature: SignatureBytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Precommit {
    pub height: Height,
    pub round: Round,
    pub value: Option<Hash32>,
    /// Per-validator seal over (H, R, V), aggregated into the quorum
    /// certificate of the committed block.
    pub committed_seal: SignatureBytes,
    pub sender: Address,
    pub signature: SignatureBytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LightProposal {
    pub height: Height,
    pub round: Round,
    pub valid_round: Option<Round>,
    pub value: Hash32,
    pub sender: Address,
    pub signature: SignatureBytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsensusMsg {
    Proposal(Proposal),
    Prevote(Prevote),
    Precommit(Precommit),
    LightProposal(LightProposal),
}

impl ConsensusMsg {
    pub fn code(&self) -> u8 {
        match self {
            ConsensusMsg::Proposal(_) => MSG_PROPOSAL,
            ConsensusMsg::Prevote(_) => MSG_PREVOTE,
            ConsensusMsg::Precommit(_) => MSG_PRECOMMIT,
            ConsensusMsg::LightProposal(_) => MSG_LIGHT_PROPOSAL,
        }
    }

    pub fn height(&self) -> Height {
        match self {
            ConsensusMsg::Proposal(p) => p.height,
            ConsensusMsg::Prevote(v) => v.height,
            ConsensusMsg::Precommit(v) => v.height,
            ConsensusMsg::LightProposal(p) => p.height,
        }
    }

    pub fn round(&self) -> Round {
        match self {
            ConsensusMsg::Proposal(p) => p.round,
            ConsensusMsg::Prevote(v) => v.round,
            ConsensusMsg::Precommit(v) => v.round,
            ConsensusMsg::LightProposal(p) => p.round,
        }
    }

    pub fn sender(&self) -> Address {
        match self {
            ConsensusMsg::Proposal(p) => p.sender,
            ConsensusMsg::Prevote(v) => v.sender,
            ConsensusMsg::Precommit(v) => v.sender,
            ConsensusMsg::LightProposal(p) => p.sender,
        }
    }

    /// The value this message speaks for; `None` is NIL. Proposals speak for
    /// their block's id.
    pub fn value(&self) -> Option<Hash32> {
        match self {
            ConsensusMsg::Proposal(p) => Some(p.block.id()),
            ConsensusMsg::Prevote(v) => v.value,
            ConsensusMsg::Precommit(v) => v.value,
            ConsensusMsg::LightProposal(p) => Some(p.value),
        }
    }

    pub fn valid_round(&self) -> Option<Round> {
        match self {
            ConsensusMsg::Proposal(p) => p.valid_round,
            ConsensusMsg::LightProposal(p) => p.valid_round,
            _ => None,
        }
    }
}

/// Flat view of a consensus message, enough for upon-rule predicates and
/// cache queries without touching the block body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Summary {
    pub code: u8,
    pub height: Height,
    pub round: Round,
    pub value: Option<Hash32>,
    pub valid_round: Option<Round>,
}

/// A decoded consensus message sealed together with its canonical payload and
/// the payload's content hash. Immutable after construction; the store and
/// cache share it behind `Arc`.
#[derive(Clone, Debug)]
pub struct Message {
    msg: ConsensusMsg,
    hash: Hash32,
    payload: Vec<u8>,
}

impl Message {
    /// Wrap an already-built message, producing its canonical encoding.
    pub fn new(msg: ConsensusMsg) -> Self {
        let payload = codec::encode_msg(&msg);
        let hash = hash_bytes(&payload);
        Self { msg, hash, payload }
    }

    /// Decode a wire payload. The hash is taken over the payload bytes as
    /// received, so byte-identical duplicates collide and distinct encodings
    /// of the same claim do not.
    pub fn decode(payload: Vec<u8>) -> Result<Self, codec::CodecError> {
        let msg = codec::decode_msg(&payload)?;
        let hash = hash_bytes(&payload);
        Ok(Self { msg, hash, payload })
    }

    pub fn msg(&self) -> &ConsensusMsg {
        &self.msg
    }

    pub fn hash(&self) -> Hash32 {
        self.hash
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn code(&self) -> u8 {
        self.msg.code()
    }

    pub fn height(&self) -> Height {
        self.msg.height()
    }

    pub fn round(&self) -> Round {
        self.msg.round()
    }

    pub fn sender(&self) -> Address {
        self.msg.sender()
    }

    pub fn value(&self) -> Option<Hash32> {
        self.msg.value()
    }

    pub fn summary(&self) -> Summary {
        Summary {
            code: self.msg.code(),
            height: self.msg.height(),
            round: self.msg.round(),
            value: self.msg.value(),
            valid_round: self.msg.valid_round(),
        }
    }

    /// Authenticate the message against a committee: the declared sender must
    /// be a member, the member's key must actually derive the declared address,
    /// the signature must verify over the payload-without-sig, and a non-NIL
    /// precommit must carry a valid committed seal.
    pub fn verify<V: Verifier>(&self, committee: &Committee) -> Result<(), VerifyError> {
        let sender = self.sender();
        let member = committee.member(&sender).ok_or(VerifyError::NotFromCommittee)?;
        if derive_address(&member.consensus_key) != sender {
            return Err(VerifyError::SignatureMismatch);
        }

        let (sign_bytes, signature) = match &self.msg {
            ConsensusMsg::Proposal(p) => (
                proposal_sign_bytes(p.height, p.round, p.valid_round, &p.block.id()),
                &p.signature,
            ),
            ConsensusMsg::Prevote(v) => {
                (prevote_sign_bytes(v.height, v.round, &v.value), &v.signature)
            }
            ConsensusMsg::Precommit(v) => {
                (precommit_sign_bytes(v.height, v.round, &v.value), &v.signature)
            }
            ConsensusMsg::LightProposal(p) => (
                proposal_sign_bytes(p.height, p.round, p.valid_round, &p.value),
                &p.signature,
            ),
        };
        V::verify(&member.consensus_key, &sign_bytes, signature)
            .map_err(|_| VerifyError::BadSignature)?;

        if let ConsensusMsg::Precommit(pc) = &self.msg {
            if pc.value.is_some() {
                let seal_bytes = committed_seal_bytes(pc.height, pc.round, &pc.value);
                V::verify(&member.consensus_key, &seal_bytes, &pc.committed_seal)
                    .map_err(|_| VerifyError::BadCommittedSeal)?;
            }
        }
        Ok(())
    }
}

// ── Deterministic sign bytes ─────────────────────────────────────────────

fn vote_bytes(domain: [u8; 4], height: Height, round: Round, value: &Option<Hash32>) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 8 + 8 + 33);
    out.extend_from_slice(&domain);
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&round.to_le_bytes());
    match value {
        Some(v) => {
            out.push(0x01);
            out.extend_from_slice(&v.0);
        }
        None => {
            out.push(0x00);
            out.extend_from_slice(&[0u8; 32]);
        }
    }
    out
}

/// Proposals and light proposals sign the same bytes: the block is represented
/// by its id, so a light proposal keeps the original proposer signature.
pub fn proposal_sign_bytes(
    height: Height,
    round: Round,
    valid_round: Option<Round>,
    value: &Hash32,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 8 + 8 + 9 + 32);
    out.extend_from_slice(&DOMAIN_PROPOSAL);
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&round.to_le_bytes());
    match valid_round {
        None => out.push(0x00),
        Some(vr) => {
            out.push(0x01);
            out.extend_from_slice(&vr.to_le_bytes());
        }
    }
    out.extend_from_slice(&value.0);
    out
}

pub fn prevote_sign_bytes(height: Height, round: Round, value: &Option<Hash32>) -> Vec<u8> {
    vote_bytes(DOMAIN_PREVOTE, height, round, value)
}

pub fn precommit_sign_bytes(height: Height, round: Round, value: &Option<Hash32>) -> Vec<u8> {
    vote_bytes(DOMAIN_PRECOMMIT, height, round, value)
}

/// Seal over (H, R, V), distinct from the precommit envelope signature so the
/// quorum certificate can be assembled from seals alone.
pub fn committed_seal_bytes(height: Height, round: Round, value: &Option<Hash32>) -> Vec<u8> {
    vote_bytes(DOMAIN_SEAL, height, round, value)
}
