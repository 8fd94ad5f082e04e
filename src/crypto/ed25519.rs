//! Ed25519 consensus keys.

use super::{derive_address, CryptoError, PublicKeyBytes, SignatureBytes, Signer, Verifier};
use crate::types::Address;
use ed25519_dalek::{
    Signature, Signer as DalekSigner, SigningKey, VerifyingKey, PUBLIC_KEY_LENGTH,
};
use rand::rngs::OsRng;

/// A validator's consensus keypair. The verifying half is derived once at
/// construction; `address()` is the identity the committee knows it by.
#[derive(Clone)]
pub struct Ed25519Keypair {
    sk: SigningKey,
    vk: VerifyingKey,
}

impl Ed25519Keypair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic keypair from a 32-byte seed. Keystore loaders and test
    /// fixtures both come through here.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    fn from_signing_key(sk: SigningKey) -> Self {
        let vk = sk.verifying_key();
        Self { sk, vk }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.sk.to_bytes()
    }

    pub fn address(&self) -> Address {
        derive_address(&self.public_key())
    }
}

impl Signer for Ed25519Keypair {
    fn public_key(&self) -> PublicKeyBytes {
        PublicKeyBytes(self.vk.as_bytes().to_vec())
    }

    fn sign(&self, msg: &[u8]) -> SignatureBytes {
        SignatureBytes(self.sk.sign(msg).to_bytes().to_vec())
    }
}

/// Stateless verification under a committee member's key.
pub struct Ed25519Verifier;

impl Verifier for Ed25519Verifier {
    fn verify(pk: &PublicKeyBytes, msg: &[u8], sig: &SignatureBytes) -> Result<(), CryptoError> {
        if pk.0.len() != PUBLIC_KEY_LENGTH {
            return Err(CryptoError::BadKeyEncoding(pk.0.len()));
        }
        let mut key = [0u8; PUBLIC_KEY_LENGTH];
        key.copy_from_slice(&pk.0);
        let vk =
            VerifyingKey::from_bytes(&key).map_err(|_| CryptoError::BadKeyEncoding(pk.0.len()))?;
        let sig = Signature::from_slice(&sig.0)
            .map_err(|_| CryptoError::BadSignatureEncoding(sig.0.len()))?;
        // strict mode rejects small-order keys and malleable encodings
        vk.verify_strict(msg, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}
