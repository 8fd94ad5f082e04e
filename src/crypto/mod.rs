use crate::types::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed public key ({0} bytes)")]
    BadKeyEncoding(usize),
    #[error("malformed signature ({0} bytes)")]
    BadSignatureEncoding(usize),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKeyBytes(pub Vec<u8>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureBytes(pub Vec<u8>);

pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKeyBytes;
    fn sign(&self, msg: &[u8]) -> SignatureBytes;
}

pub trait Verifier: Send + Sync {
    fn verify(pk: &PublicKeyBytes, msg: &[u8], sig: &SignatureBytes) -> Result<(), CryptoError>;
}

/// Account address derived from a consensus public key: first 20 bytes of
/// blake3(pk). Message senders declare their address on the wire; verification
/// recomputes it from the committee key and rejects mismatches.
pub fn derive_address(pk: &PublicKeyBytes) -> Address {
    let h = blake3::hash(&pk.0);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h.as_bytes()[..20]);
    Address(out)
}

pub mod ed25519;
