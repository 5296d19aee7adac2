//! Streaming Ed25519ph signatures for downloaded content
//!
//! The payload is fed chunk by chunk into a SHA-512 prehash so the whole file
//! never has to sit in memory. Signing and verification both bind the
//! `update` context string, so a signature made for another purpose never
//! verifies here.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};

use crate::error::{NetError, Result};

pub const SIGNATURE_LEN: usize = 64;
pub const SIGNING_KEY_LEN: usize = 32;

const SIGN_CONTEXT: &[u8] = b"update";

/// Incremental verifier; feed every chunk, then call [`StreamVerifier::verify`]
#[derive(Clone, Default)]
pub struct StreamVerifier {
    prehash: Sha512,
}

impl StreamVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.prehash.update(chunk);
    }

    pub fn verify(self, key: &VerifyingKey, signature: &[u8; SIGNATURE_LEN]) -> Result<()> {
        let signature = Signature::from_bytes(signature);
        key.verify_prehashed_strict(self.prehash, Some(SIGN_CONTEXT), &signature)
            .map_err(|_| NetError::BadSignature)
    }
}

/// Incremental signer, the mirror image of [`StreamVerifier`]
#[derive(Clone, Default)]
pub struct StreamSigner {
    prehash: Sha512,
}

impl StreamSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.prehash.update(chunk);
    }

    pub fn sign(self, key: &SigningKey) -> Result<[u8; SIGNATURE_LEN]> {
        let signature = key
            .sign_prehashed(self.prehash, Some(SIGN_CONTEXT))
            .map_err(|_| NetError::InvalidKey)?;
        Ok(signature.to_bytes())
    }
}

/// Signs an in-memory payload in one go
pub fn sign_payload(key: &SigningKey, payload: &[u8]) -> Result<[u8; SIGNATURE_LEN]> {
    let mut signer = StreamSigner::new();
    signer.update(payload);
    signer.sign(key)
}

pub fn verifying_key(bytes: &[u8; SIGNING_KEY_LEN]) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(bytes).map_err(|_| NetError::InvalidKey)
}
