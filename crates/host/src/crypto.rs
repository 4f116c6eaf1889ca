//! The end-to-end crypto channel.
//!
//! One symmetric key per session, derived from the PIN with HKDF-SHA-256 and
//! used with AES-256-GCM. Every ciphertext on the wire is
//! `nonce(12) || ciphertext || tag(16)`; nonces are random, which is fine for
//! the packet counts a single session reaches. Control framing (the kind tag
//! and stream length prefix) stays in the clear.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroize;

const HKDF_SALT: &[u8] = b"AirCatch-E2EE-v1";
const HKDF_INFO: &[u8] = b"AirCatch-Session";

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Smallest decryptable message: nonce + tag + one payload byte.
pub const MIN_MESSAGE_LEN: usize = NONCE_LEN + TAG_LEN + 1;

/// Per-session AEAD channel. The key exists iff a session exists and is
/// zeroed on teardown and on drop.
#[derive(Default)]
pub struct SessionCrypto {
    key: Option<[u8; 32]>,
}

impl SessionCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive and install the session key for a PIN. Derivation is
    /// deterministic: the client runs the same computation on its side.
    pub fn derive_key(&mut self, pin: &str) {
        self.clear_key();
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), pin.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        self.key = Some(key);
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Zero and forget the key.
    pub fn clear_key(&mut self) {
        if let Some(mut key) = self.key.take() {
            key.zeroize();
        }
    }

    /// Encrypt a payload. `None` without a key.
    pub fn encrypt(&self, plaintext: &[u8]) -> Option<Vec<u8>> {
        let key = self.key.as_ref()?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher.encrypt(Nonce::from_slice(&nonce), plaintext).ok()?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Some(out)
    }

    /// Decrypt a wire message. `None` without a key, for undersized
    /// messages, and on authentication failure; the caller drops silently
    /// either way, never answering the peer.
    pub fn decrypt(&self, message: &[u8]) -> Option<Vec<u8>> {
        let key = self.key.as_ref()?;
        if message.len() < MIN_MESSAGE_LEN {
            return None;
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        let (nonce, ciphertext) = message.split_at(NONCE_LEN);
        cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()
    }
}

impl Drop for SessionCrypto {
    fn drop(&mut self) {
        self.clear_key();
    }
}

/// Constant-time byte comparison for PIN checks; true only when both slices
/// have equal length and identical contents.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
