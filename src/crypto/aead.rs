//! AEAD operations: ChaCha20-Poly1305 for handshake fields and transport
//! data, XChaCha20-Poly1305 for cookie replies.
//!
//! Transport packets are sealed and opened in place so the hot path never
//! allocates; the Vec-returning variants exist for the small fixed-size
//! handshake fields.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Nonce, Tag, XChaCha20Poly1305, XNonce,
};

use super::Key;
use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// The protocol nonce: 4 zero bytes followed by the 64-bit counter,
/// little-endian.
fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Encrypt with ChaCha20-Poly1305, returning ciphertext || tag
pub fn encrypt(
    key: &Key,
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = counter_nonce(counter);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt with ChaCha20-Poly1305
pub fn decrypt(
    key: &Key,
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = counter_nonce(counter);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

/// A transport cipher bound to one directional session key.
///
/// Cloning the underlying cipher per packet is free of key re-expansion
/// cost concerns here; the instance itself is kept per keypair so the key
/// schedule is computed once.
#[derive(Clone)]
pub struct TransportCipher {
    cipher: ChaCha20Poly1305,
}

impl TransportCipher {
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Seal `buf[..buf.len() - TAG_LEN]` in place, writing the tag into the
    /// final 16 bytes. The buffer must already include tag space.
    pub fn seal_in_place(&self, counter: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() < TAG_LEN {
            return Err(CryptoError::Encryption);
        }
        let nonce = counter_nonce(counter);
        let split = buf.len() - TAG_LEN;
        let (msg, tag_out) = buf.split_at_mut(split);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], msg)
            .map_err(|_| CryptoError::Encryption)?;
        tag_out.copy_from_slice(&tag);
        Ok(())
    }

    /// Open `buf` (ciphertext || tag) in place. On success the plaintext
    /// occupies `buf[..buf.len() - TAG_LEN]`.
    pub fn open_in_place(&self, counter: u64, buf: &mut [u8]) -> Result<usize, CryptoError> {
        if buf.len() < TAG_LEN {
            return Err(CryptoError::Decryption);
        }
        let nonce = counter_nonce(counter);
        let split = buf.len() - TAG_LEN;
        let (msg, tag) = buf.split_at_mut(split);
        self.cipher
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), &[], msg, Tag::from_slice(tag))
            .map_err(|_| CryptoError::Decryption)?;
        Ok(split)
    }
}

/// Encrypt with XChaCha20-Poly1305 (cookie replies)
pub fn xencrypt(
    key: &Key,
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt with XChaCha20-Poly1305 (cookie replies)
pub fn xdecrypt(
    key: &Key,
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_with_aad() {
        let key = [9u8; 32];
        let ct = encrypt(&key, 7, b"payload", b"aad").unwrap();
        assert_eq!(ct.len(), 7 + TAG_LEN);
        assert_eq!(decrypt(&key, 7, &ct, b"aad").unwrap(), b"payload");
        assert!(decrypt(&key, 8, &ct, b"aad").is_err());
        assert!(decrypt(&key, 7, &ct, b"bad").is_err());
    }

    #[test]
    fn in_place_matches_allocating_path() {
        let key = [1u8; 32];
        let cipher = TransportCipher::new(&key);

        let mut buf = b"sixteen byte msg".to_vec();
        buf.extend_from_slice(&[0u8; TAG_LEN]);
        cipher.seal_in_place(42, &mut buf).unwrap();

        let reference = encrypt(&key, 42, b"sixteen byte msg", &[]).unwrap();
        assert_eq!(buf, reference);

        let len = cipher.open_in_place(42, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"sixteen byte msg");
    }

    #[test]
    fn in_place_rejects_tampering() {
        let key = [1u8; 32];
        let cipher = TransportCipher::new(&key);

        let mut buf = vec![0u8; 32 + TAG_LEN];
        cipher.seal_in_place(0, &mut buf).unwrap();
        buf[3] ^= 1;
        assert!(cipher.open_in_place(0, &mut buf).is_err());
    }

    #[test]
    fn empty_plaintext_is_just_a_tag() {
        let key = [0u8; 32];
        let ct = encrypt(&key, 0, &[], &[]).unwrap();
        assert_eq!(ct.len(), TAG_LEN);
        assert!(decrypt(&key, 0, &ct, &[]).unwrap().is_empty());
    }

    #[test]
    fn xchacha_roundtrip() {
        let key = [5u8; 32];
        let nonce = [6u8; 24];
        let ct = xencrypt(&key, &nonce, b"cookie-bytes-16b", b"mac1").unwrap();
        assert_eq!(xdecrypt(&key, &nonce, &ct, b"mac1").unwrap(), b"cookie-bytes-16b");
        assert!(xdecrypt(&key, &nonce, &ct, b"mac2").is_err());
    }
}
