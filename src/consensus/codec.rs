//! Canonical wire codec for consensus messages.
//!
//! Envelope: [code: u8][payload]. All integers little-endian, all variable
//! fields u32-length-prefixed. The algorithm's validRound = -1 cannot be
//! expressed as an unsigned integer, so the wire carries (u64, is_nil) and the
//! decoder rejects inconsistent pairs.

use crate::consensus::messages::{
    ConsensusMsg, LightProposal, Precommit, Prevote, Proposal, MSG_LIGHT_PROPOSAL, MSG_PRECOMMIT,
    MSG_PREVOTE, MSG_PROPOSAL,
};
use crate::crypto::SignatureBytes;
use crate::types::{Address, Block, BlockHeader, Hash32, Height, Round, MAX_ROUND};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(&'static str),
    #[error("unexpected message code {0}")]
    UnexpectedCode(u8),
    #[error("round {0} exceeds the protocol bound")]
    InvalidRound(u64),
    #[error("proposal carries a nil block")]
    NilBlock,
    #[error("trailing bytes after payload")]
    TrailingBytes,
}

// ── Writer helpers ───────────────────────────────────────────────────────

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bool(out: &mut Vec<u8>, v: bool) {
    out.push(v as u8);
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_le_bytes());
    out.extend_from_slice(b);
}

fn put_opt_hash(out: &mut Vec<u8>, v: &Option<Hash32>) {
    match v {
        Some(h) => {
            out.push(0x01);
            out.extend_from_slice(&h.0);
        }
        None => {
            out.push(0x00);
            out.extend_from_slice(&[0u8; 32]);
        }
    }
}

fn put_valid_round(out: &mut Vec<u8>, vr: Option<Round>) {
    match vr {
        Some(r) => {
            put_u64(out, r);
            put_bool(out, false);
        }
        None => {
            put_u64(out, 0);
            put_bool(out, true);
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() - self.pos < n {
            return Err(CodecError::Malformed("truncated payload"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::Malformed("bad boolean byte")),
        }
    }

    fn hash(&mut self) -> Result<Hash32, CodecError> {
        let b = self.take(32)?;
        Ok(Hash32(b.try_into().unwrap()))
    }

    fn address(&mut self) -> Result<Address, CodecError> {
        let b = self.take(20)?;
        Ok(Address(b.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = u32::from_le_bytes(self.take(4)?.try_into().unwrap()) as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn opt_hash(&mut self) -> Result<Option<Hash32>, CodecError> {
        let flag = self.bool()?;
        let h = self.hash()?;
        if flag {
            Ok(Some(h))
        } else if h == Hash32::zero() {
            Ok(None)
        } else {
            Err(CodecError::Malformed("nil value with non-zero hash"))
        }
    }

    fn round(&mut self) -> Result<Round, CodecError> {
        let r = self.u64()?;
        if r > MAX_ROUND {
            return Err(CodecError::InvalidRound(r));
        }
        Ok(r)
    }

    fn valid_round(&mut self) -> Result<Option<Round>, CodecError> {
        let raw = self.u64()?;
        let is_nil = self.bool()?;
        if is_nil {
            if raw != 0 {
                return Err(CodecError::Malformed("nil validRound with non-zero round"));
            }
            return Ok(None);
        }
        if raw > MAX_ROUND {
            return Err(CodecError::InvalidRound(raw));
        }
        Ok(Some(raw))
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.pos != self.buf.len() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(())
    }
}

// ── Block encoding ───────────────────────────────────────────────────────

fn encode_block(out: &mut Vec<u8>, b: &Block) {
    let mut inner = Vec::with_capacity(8 + 8 + 32 + 20 + 8 + 32 + 4 + b.payload.len());
    put_u64(&mut inner, b.header.height);
    put_u64(&mut inner, b.header.round);
    inner.extend_from_slice(&b.header.parent.0);
    inner.extend_from_slice(&b.header.proposer.0);
    put_u64(&mut inner, b.header.timestamp);
    inner.extend_from_slice(&b.header.payload_root.0);
    put_bytes(&mut inner, &b.payload);
    put_bytes(out, &inner);
}

fn decode_block(r: &mut Reader) -> Result<Block, CodecError> {
    let inner = r.bytes()?;
    if inner.is_empty() {
        return Err(CodecError::NilBlock);
    }
    let mut br = Reader::new(&inner);
    let height: Height = br.u64()?;
    let round = br.round()?;
    let parent = br.hash()?;
    let proposer = br.address()?;
    let timestamp = br.u64()?;
    let payload_root = br.hash()?;
    let payload = br.bytes()?;
    br.finish()?;
    Ok(Block {
        header: BlockHeader { height, round, parent, proposer, timestamp, payload_root },
        payload,
    })
}

// ── Message envelope ─────────────────────────────────────────────────────

pub fn encode_msg(msg: &ConsensusMsg) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.push(msg.code());
    match msg {
        ConsensusMsg::Proposal(p) => {
            put_u64(&mut out, p.height);
            put_u64(&mut out, p.round);
            put_valid_round(&mut out, p.valid_round);
            encode_block(&mut out, &p.block);
            out.extend_from_slice(&p.sender.0);
            put_bytes(&mut out, &p.signature.0);
        }
        ConsensusMsg::Prevote(v) => {
            put_u64(&mut out, v.height);
            put_u64(&mut out, v.round);
            put_opt_hash(&mut out, &v.value);
            out.extend_from_slice(&v.sender.0);
            put_bytes(&mut out, &v.signature.0);
        }
        ConsensusMsg::Precommit(v) => {
            put_u64(&mut out, v.height);
            put_u64(&mut out, v.round);
            put_opt_hash(&mut out, &v.value);
            put_bytes(&mut out, &v.committed_seal.0);
            out.extend_from_slice(&v.sender.0);
            put_bytes(&mut out, &v.signature.0);
        }
        ConsensusMsg::LightProposal(p) => {
            put_u64(&mut out, p.height);
            put_u64(&mut out, p.round);
            put_valid_round(&mut out, p.valid_round);
            out.extend_from_slice(&p.value.0);
            out.extend_from_slice(&p.sender.0);
            put_bytes(&mut out, &p.signature.0);
        }
    }
    out
}

pub fn decode_msg(payload: &[u8]) -> Result<ConsensusMsg, CodecError> {
    let mut r = Reader::new(payload);
    let code = r.u8()?;
    let msg = match code {
        MSG_PROPOSAL => {
            let height = r.u64()?;
            let round = r.round()?;
            let valid_round = r.valid_round()?;
            let block = decode_block(&mut r)?;
            let sender = r.address()?;
            let signature = SignatureBytes(r.bytes()?);
            ConsensusMsg::Proposal(Proposal { height, round, valid_round, block, sender, signature })
        }
        MSG_PREVOTE => {
            let height = r.u64()?;
            let round = r.round()?;
            let value = r.opt_hash()?;
            let sender = r.address()?;
            let signature = SignatureBytes(r.bytes()?);
            ConsensusMsg::Prevote(Prevote { height, round, value, sender, signature })
        }
        MSG_PRECOMMIT => {
            let height = r.u64()?;
            let round = r.round()?;
            let value = r.opt_hash()?;
            let committed_seal = SignatureBytes(r.bytes()?);
            let sender = r.address()?;
            let signature = SignatureBytes(r.bytes()?);
            ConsensusMsg::Precommit(Precommit {
                height,
                round,
                value,
                committed_seal,
                sender,
                signature,
            })
        }
        MSG_LIGHT_PROPOSAL => {
            let height = r.u64()?;
            let round = r.round()?;
            let valid_round = r.valid_round()?;
            let value = r.hash()?;
            let sender = r.address()?;
            let signature = SignatureBytes(r.bytes()?);
            ConsensusMsg::LightProposal(LightProposal {
                height,
                round,
                valid_round,
                value,
                sender,
                signature,
            })
        }
        other => return Err(CodecError::UnexpectedCode(other)),
    };
    r.finish()?;
    Ok(msg)
}
