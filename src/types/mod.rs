pub type Height = u64;
pub type Round = u64;

/// Rounds above this bound are rejected at decode time and the engine never
/// advances past it.
pub const MAX_ROUND: Round = 99;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// 20-byte account address. Proposer ties and map orderings use the derived
/// lexicographic `Ord`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn zero() -> Self {
        Self([0u8; 20])
    }

    /// Address with every byte zero except the last, e.g. the protocol
    /// precompile addresses 0x…fc..0x…ff.
    pub const fn from_low_byte(b: u8) -> Self {
        let mut a = [0u8; 20];
        a[19] = b;
        Self(a)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: Height,
    pub round: Round,
    pub parent: Hash32,
    pub proposer: Address,
    /// Unix timestamp (seconds) at proposal time.
    pub timestamp: u64,
    pub payload_root: Hash32,
}

/// A candidate block. Execution is owned by a collaborator, so the body is an
/// opaque payload; the header binds it via `payload_root`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

impl Block {
    /// Deterministic block ID over a fixed binary header encoding.
    ///
    /// Format: "NAXOS_BLK" || height(8 LE) || round(8 LE) || parent(32) ||
    ///         proposer(20) || timestamp(8 LE) || payload_root(32)
    pub fn id(&self) -> Hash32 {
        let h = &self.header;
        let mut buf = Vec::with_capacity(9 + 8 + 8 + 32 + 20 + 8 + 32);
        buf.extend_from_slice(b"NAXOS_BLK");
        buf.extend_from_slice(&h.height.to_le_bytes());
        buf.extend_from_slice(&h.round.to_le_bytes());
        buf.extend_from_slice(&h.parent.0);
        buf.extend_from_slice(&h.proposer.0);
        buf.extend_from_slice(&h.timestamp.to_le_bytes());
        buf.extend_from_slice(&h.payload_root.0);
        hash_bytes(&buf)
    }
}

pub fn hash_bytes(b: &[u8]) -> Hash32 {
    let h = blake3::hash(b);
    let mut out = [0u8; 32];
    out.copy_from_slice(h.as_bytes());
    Hash32(out)
}

/// Root over the opaque block payload, domain-separated from plain hashing.
pub fn payload_root(payload: &[u8]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"NAXOS_PLD");
    hasher.update(&(payload.len() as u64).to_le_bytes());
    hasher.update(payload);
    let h = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(h.as_bytes());
    Hash32(out)
}
