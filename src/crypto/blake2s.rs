//! BLAKE2s primitives: hash, keyed MAC, and the HKDF chain used for all
//! protocol key derivation.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;

use super::Key;

/// RFC 2104 HMAC instantiated over BLAKE2s-256
type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 output
pub const HASH_LEN: usize = 32;

/// Length of the truncated keyed MAC used on handshake messages
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 of a single input
pub fn hash(data: &[u8]) -> Key {
    let mut h = Blake2s256::new();
    Digest::update(&mut h, data);
    h.finalize().into()
}

/// BLAKE2s-256 of two concatenated inputs, HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> Key {
    let mut h = Blake2s256::new();
    Digest::update(&mut h, a);
    Digest::update(&mut h, b);
    h.finalize().into()
}

/// Keyed BLAKE2s MAC truncated to 16 bytes.
///
/// The key may be any length up to 32 bytes: MAC1 uses a 32-byte derived
/// key, MAC2 uses the 16-byte cookie itself.
pub fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut m = Blake2sMac::<U16>::new_from_slice(key).expect("MAC key fits BLAKE2s");
    MacTrait::update(&mut m, data);
    m.finalize_fixed().into()
}

/// HMAC-BLAKE2s, the PRF underneath the KDF chain
fn hmac(key: &[u8], data: &[u8]) -> Key {
    let mut m = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut m, data);
    m.finalize_fixed().into()
}

/// KDF with one output: T1 = HMAC(HMAC(key, input), 0x01)
pub fn kdf1(key: &Key, input: &[u8]) -> Key {
    let prk = hmac(key, input);
    hmac(&prk, &[0x01])
}

/// KDF with two outputs
pub fn kdf2(key: &Key, input: &[u8]) -> (Key, Key) {
    let prk = hmac(key, input);
    let t1 = hmac(&prk, &[0x01]);
    let t2 = hmac(&prk, &chain(&t1, 0x02));
    (t1, t2)
}

/// KDF with three outputs (chain key, hash input, AEAD key for the PSK mix)
pub fn kdf3(key: &Key, input: &[u8]) -> (Key, Key, Key) {
    let prk = hmac(key, input);
    let t1 = hmac(&prk, &[0x01]);
    let t2 = hmac(&prk, &chain(&t1, 0x02));
    let t3 = hmac(&prk, &chain(&t2, 0x03));
    (t1, t2, t3)
}

fn chain(prev: &Key, counter: u8) -> [u8; HASH_LEN + 1] {
    let mut buf = [0u8; HASH_LEN + 1];
    buf[..HASH_LEN].copy_from_slice(prev);
    buf[HASH_LEN] = counter;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_two_matches_concatenation() {
        let joined = [b"hello" as &[u8], b"world"].concat();
        assert_eq!(hash_two(b"hello", b"world"), hash(&joined));
    }

    #[test]
    fn mac_accepts_short_keys() {
        let long = mac(&[7u8; 32], b"payload");
        let short = mac(&[7u8; 16], b"payload");
        assert_eq!(long.len(), MAC_LEN);
        assert_ne!(long, short);
    }

    #[test]
    fn kdf_outputs_are_distinct() {
        let key = [0u8; 32];
        let (a, b) = kdf2(&key, b"input");
        let (c, d, e) = kdf3(&key, b"input");
        assert_eq!(a, c);
        assert_eq!(b, d);
        assert_ne!(a, b);
        assert_ne!(d, e);
    }

    #[test]
    fn kdf1_matches_kdf2_first_output() {
        let key = [3u8; 32];
        let (t1, _) = kdf2(&key, b"x");
        assert_eq!(kdf1(&key, b"x"), t1);
    }
}
