//! Noise symmetric-state operations for the IKpsk2 pattern
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s. This module owns the
//! chaining-key / hash mixing; the full handshake state machine lives in
//! the device layer.

use super::{aead, blake2s, Key};
use crate::error::CryptoError;

/// Noise construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// Protocol identifier mixed into the initial hash
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie-reply key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// The evolving (chaining key, hash) pair of an in-flight handshake
#[derive(Clone)]
pub struct NoiseState {
    pub chain_key: Key,
    pub hash: Key,
}

impl NoiseState {
    /// HASH(CONSTRUCTION), the fixed initial chaining key
    pub fn initial_chain_key() -> Key {
        blake2s::hash(CONSTRUCTION)
    }

    /// Both sides seed the hash with the responder's static public key:
    /// h = HASH(HASH(HASH(CONSTRUCTION) || IDENTIFIER) || responder_static)
    pub fn new(responder_static: &Key) -> Self {
        let ck = Self::initial_chain_key();
        let h = blake2s::hash_two(&blake2s::hash_two(&ck, IDENTIFIER), responder_static);
        Self { chain_key: ck, hash: h }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// ck = KDF1(ck, input); used for ephemeral public keys
    pub fn mix_chain(&mut self, input: &[u8]) {
        self.chain_key = blake2s::kdf1(&self.chain_key, input);
    }

    /// (ck, k) = KDF2(ck, input); returns the derived AEAD key
    pub fn mix_key(&mut self, input: &[u8]) -> Key {
        let (ck, key) = blake2s::kdf2(&self.chain_key, input);
        self.chain_key = ck;
        key
    }

    /// (ck, tau, k) = KDF3(ck, psk); tau is mixed into the hash.
    pub fn mix_psk(&mut self, psk: &Key) -> Key {
        let (ck, tau, key) = blake2s::kdf3(&self.chain_key, psk);
        self.chain_key = ck;
        self.mix_hash(&tau);
        key
    }

    /// AEAD-seal with zero nonce and the running hash as AD, then mix the
    /// ciphertext into the hash.
    pub fn seal_and_mix(&mut self, key: &Key, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::encrypt(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Counterpart of [`seal_and_mix`](Self::seal_and_mix)
    pub fn open_and_mix(&mut self, key: &Key, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::decrypt(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Final key split. The initiator sends under the first output; the
    /// responder sends under the second.
    pub fn split(&self) -> (Key, Key) {
        blake2s::kdf2(&self.chain_key, &[])
    }
}

/// mac1_key = HASH("mac1----" || recipient_static)
pub fn mac1_key(recipient_static: &Key) -> Key {
    blake2s::hash_two(LABEL_MAC1, recipient_static)
}

/// cookie_key = HASH("cookie--" || recipient_static)
pub fn cookie_key(recipient_static: &Key) -> Key {
    blake2s::hash_two(LABEL_COOKIE, recipient_static)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_deterministic() {
        let pk = [11u8; 32];
        let a = NoiseState::new(&pk);
        let b = NoiseState::new(&pk);
        assert_eq!(a.chain_key, b.chain_key);
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, NoiseState::new(&[12u8; 32]).hash);
    }

    #[test]
    fn seal_open_keep_hashes_in_sync() {
        let mut sender = NoiseState::new(&[0u8; 32]);
        let mut receiver = sender.clone();
        let key = [42u8; 32];

        let ct = sender.seal_and_mix(&key, b"static-key-bytes").unwrap();
        let pt = receiver.open_and_mix(&key, &ct).unwrap();

        assert_eq!(pt, b"static-key-bytes");
        assert_eq!(sender.hash, receiver.hash);
    }

    #[test]
    fn split_outputs_swap_roles() {
        let state = NoiseState::new(&[1u8; 32]);
        let (a, b) = state.split();
        assert_ne!(a, b);
    }

    #[test]
    fn mac_labels_derive_distinct_keys() {
        let pk = [9u8; 32];
        assert_ne!(mac1_key(&pk), cookie_key(&pk));
    }
}
