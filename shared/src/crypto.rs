//! Key exchange primitives, key derivation and the AEAD record cipher
//!
//! X25519 provides the Diffie-Hellman operations, HMAC-SHA256 provides the
//! extract/expand key schedule, ChaCha20-Poly1305 seals records. Every secret
//! produced here is wiped when dropped.

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{NetError, Result};

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Purpose a session is scoped to, mixed into every derived key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionContext {
    Room,
    Race,
    Update,
}

impl SessionContext {
    pub fn label(self) -> &'static [u8; 8] {
        match self {
            SessionContext::Room => b"room    ",
            SessionContext::Race => b"race    ",
            SessionContext::Update => b"update  ",
        }
    }
}

/// X25519 public key as sent on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        Ok(Self(decode_hex_key(text)?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn to_dalek(self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

/// Long-lived X25519 identity of a server or client
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    pub fn from_secret_hex(text: &str) -> Result<Self> {
        let bytes = Zeroizing::new(decode_hex_key(text)?);
        Ok(Self::from_secret_bytes(*bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Shared secret with a peer key, rejecting low-order points
    pub fn diffie_hellman(&self, peer: &PublicKey) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let shared = self.secret.diffie_hellman(&peer.to_dalek());
        if !shared.was_contributory() {
            return Err(NetError::Handshake("non-contributory key"));
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

impl Clone for Keypair {
    fn clone(&self) -> Self {
        Self::from_secret(self.secret.clone())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Decodes a 32-byte key given as 64 hex digits
pub fn decode_hex_key(text: &str) -> Result<[u8; KEY_LEN]> {
    let mut bytes = [0u8; KEY_LEN];
    hex::decode_to_slice(text.trim(), &mut bytes).map_err(|_| NetError::InvalidKey)?;
    Ok(bytes)
}

/// Running hash over every handshake input; the final value salts the key schedule
pub struct Transcript(Sha256);

impl Transcript {
    pub fn new(protocol: &[u8], context: SessionContext) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(protocol);
        hasher.update(context.label());
        Self(hasher)
    }

    pub fn mix(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> [u8; 32] {
        self.0.finalize().into()
    }
}

pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(salt).map_err(|_| NetError::InvalidKey)?;
    mac.update(ikm);
    Ok(Zeroizing::new(mac.finalize().into_bytes().into()))
}

/// Single-block expand, enough for one 32-byte key per label
pub fn hkdf_expand(prk: &[u8; KEY_LEN], info: &[&[u8]]) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(prk).map_err(|_| NetError::InvalidKey)?;
    for part in info {
        mac.update(part);
    }
    mac.update(&[1u8]);
    Ok(Zeroizing::new(mac.finalize().into_bytes().into()))
}

/// One direction of an AEAD channel with its own nonce counter
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn nonce(counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        nonce
    }

    /// Encrypts `buffer` in place under the next implicit nonce
    pub fn seal(&mut self, aad: &[u8], buffer: &mut Vec<u8>) -> Result<u64> {
        let counter = self.next_counter()?;
        self.seal_at(counter, aad, buffer)?;
        Ok(counter)
    }

    /// Decrypts `buffer` in place, expecting the next implicit nonce
    pub fn open(&mut self, aad: &[u8], buffer: &mut Vec<u8>) -> Result<()> {
        let counter = self.next_counter()?;
        self.open_at(counter, aad, buffer)
    }

    pub fn seal_at(&self, counter: u64, aad: &[u8], buffer: &mut Vec<u8>) -> Result<()> {
        let nonce = Self::nonce(counter);
        self.cipher
            .encrypt_in_place(Nonce::from_slice(&nonce), aad, buffer)
            .map_err(|_| NetError::TooLarge {
                size: buffer.len(),
                limit: u32::MAX as usize,
            })
    }

    /// Decrypts with an explicit nonce. The buffer is wiped on failure.
    pub fn open_at(&self, counter: u64, aad: &[u8], buffer: &mut Vec<u8>) -> Result<()> {
        let nonce = Self::nonce(counter);
        self.cipher
            .decrypt_in_place(Nonce::from_slice(&nonce), aad, buffer)
            .map_err(|_| {
                buffer.zeroize();
                NetError::Decrypt
            })
    }

    fn next_counter(&mut self) -> Result<u64> {
        let counter = self.counter;
        self.counter = counter.checked_add(1).ok_or(NetError::NonceExhausted)?;
        Ok(counter)
    }
}
