//! Cookie-based DoS protection
//!
//! Both halves of the mechanism live here. [`CookieChecker`] is device
//! state: it validates MAC1/MAC2 on inbound handshake messages and mints
//! cookie replies while under load. [`CookieGenerator`] is per-peer state:
//! it stamps MAC1/MAC2 onto outbound handshake messages and consumes the
//! cookie replies the other side sends back.
//!
//! A cookie is a 16-byte MAC of the source endpoint under a device secret
//! that rotates every two minutes, so it proves return-routability without
//! any state kept per initiator.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::crypto::{aead, blake2s, noise, Key};
use crate::error::{CryptoError, ProtocolError};
use crate::protocol::messages::{self, CookieReply};

/// Cookies (and the secret minting them) are valid this long
pub const COOKIE_REFRESH_TIME: Duration = Duration::from_secs(120);

/// Cookie length
pub const COOKIE_LEN: usize = 16;

/// MAC1/MAC2 offsets for a raw handshake message, determined by its size.
/// Returns (mac1 offset, mac2 offset).
fn mac_offsets(len: usize) -> Option<(usize, usize)> {
    match len {
        messages::INITIATION_SIZE => Some((
            messages::MessageInitiation::MAC1_OFFSET,
            messages::MessageInitiation::MAC2_OFFSET,
        )),
        messages::RESPONSE_SIZE => Some((
            messages::MessageResponse::MAC1_OFFSET,
            messages::MessageResponse::MAC2_OFFSET,
        )),
        _ => None,
    }
}

/// Source endpoint serialized for cookie computation: address octets
/// followed by the little-endian port.
fn endpoint_bytes(src: &SocketAddr) -> Vec<u8> {
    let mut bytes = match src.ip() {
        std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
        std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend_from_slice(&src.port().to_le_bytes());
    bytes
}

/// Inbound handshake MAC validation and cookie-reply minting
pub struct CookieChecker {
    mac1_key: Key,
    cookie_encryption_key: Key,
    secret: [u8; 32],
    secret_set: Option<Instant>,
}

impl CookieChecker {
    /// Keys are bound to the device's static public key
    pub fn new(device_public: &Key) -> Self {
        Self {
            mac1_key: noise::mac1_key(device_public),
            cookie_encryption_key: noise::cookie_key(device_public),
            secret: [0u8; 32],
            secret_set: None,
        }
    }

    /// Re-derive the MAC keys after an identity change
    pub fn rekey(&mut self, device_public: &Key) {
        self.mac1_key = noise::mac1_key(device_public);
        self.cookie_encryption_key = noise::cookie_key(device_public);
    }

    /// Verify MAC1 on a raw initiation or response message
    pub fn check_mac1(&self, msg: &[u8]) -> bool {
        let Some((mac1_off, mac2_off)) = mac_offsets(msg.len()) else {
            return false;
        };
        let expected = blake2s::mac(&self.mac1_key, &msg[..mac1_off]);
        expected.ct_eq(&msg[mac1_off..mac2_off]).into()
    }

    /// Verify MAC2 against the cookie currently bound to `src`
    pub fn check_mac2(&self, msg: &[u8], src: &SocketAddr) -> bool {
        let Some((_, mac2_off)) = mac_offsets(msg.len()) else {
            return false;
        };
        if !self.secret_fresh() {
            return false;
        }
        let cookie = blake2s::mac(&self.secret, &endpoint_bytes(src));
        let expected = blake2s::mac(&cookie, &msg[..mac2_off]);
        expected.ct_eq(&msg[mac2_off..]).into()
    }

    fn secret_fresh(&self) -> bool {
        self.secret_set
            .is_some_and(|t| t.elapsed() < COOKIE_REFRESH_TIME)
    }

    /// Build a cookie reply for a message that failed MAC2 while under
    /// load. `receiver` is the sender index taken from that message.
    pub fn create_reply(
        &mut self,
        msg: &[u8],
        receiver: u32,
        src: &SocketAddr,
    ) -> Result<CookieReply, ProtocolError> {
        let (mac1_off, mac2_off) = mac_offsets(msg.len()).ok_or_else(|| {
            ProtocolError::InvalidMessageLength {
                expected: messages::INITIATION_SIZE,
                got: msg.len(),
            }
        })?;

        if !self.secret_fresh() {
            rand::rngs::OsRng.fill_bytes(&mut self.secret);
            self.secret_set = Some(Instant::now());
        }

        let cookie = blake2s::mac(&self.secret, &endpoint_bytes(src));

        let mut nonce = [0u8; aead::XNONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let sealed = aead::xencrypt(
            &self.cookie_encryption_key,
            &nonce,
            &cookie,
            &msg[mac1_off..mac2_off],
        )
        .map_err(|_| ProtocolError::MacVerificationFailed)?;

        Ok(CookieReply {
            receiver,
            nonce,
            encrypted_cookie: sealed.try_into().expect("cookie ciphertext is 32 bytes"),
        })
    }
}

/// Outbound handshake MAC stamping and cookie-reply consumption,
/// one per peer
pub struct CookieGenerator {
    mac1_key: Key,
    cookie_decryption_key: Key,
    last_mac1: Option<[u8; 16]>,
    cookie: Option<[u8; COOKIE_LEN]>,
    cookie_set: Option<Instant>,
}

impl CookieGenerator {
    /// Keys are bound to the remote peer's static public key
    pub fn new(peer_public: &Key) -> Self {
        Self {
            mac1_key: noise::mac1_key(peer_public),
            cookie_decryption_key: noise::cookie_key(peer_public),
            last_mac1: None,
            cookie: None,
            cookie_set: None,
        }
    }

    /// Stamp MAC1 (always) and MAC2 (when a fresh cookie is held) onto a
    /// fully serialized handshake message.
    pub fn add_macs(&mut self, msg: &mut [u8]) {
        let Some((mac1_off, mac2_off)) = mac_offsets(msg.len()) else {
            return;
        };

        let mac1 = blake2s::mac(&self.mac1_key, &msg[..mac1_off]);
        msg[mac1_off..mac2_off].copy_from_slice(&mac1);
        self.last_mac1 = Some(mac1);

        if let Some(cookie) = self.fresh_cookie() {
            let mac2 = blake2s::mac(&cookie, &msg[..mac2_off]);
            msg[mac2_off..].copy_from_slice(&mac2);
        }
    }

    fn fresh_cookie(&self) -> Option<[u8; COOKIE_LEN]> {
        let set = self.cookie_set?;
        (set.elapsed() < COOKIE_REFRESH_TIME).then_some(self.cookie?)
    }

    /// Decrypt and store the cookie from a reply. Fails when no initiation
    /// was sent (no MAC1 to authenticate against) or the reply is forged.
    pub fn consume_reply(&mut self, reply: &CookieReply) -> Result<(), ProtocolError> {
        let last_mac1 = self.last_mac1.ok_or(ProtocolError::InvalidState)?;

        let cookie = aead::xdecrypt(
            &self.cookie_decryption_key,
            &reply.nonce,
            &reply.encrypted_cookie,
            &last_mac1,
        )
        .map_err(|_: CryptoError| ProtocolError::MacVerificationFailed)?;

        self.cookie = Some(
            cookie
                .try_into()
                .map_err(|_| ProtocolError::MacVerificationFailed)?,
        );
        self.cookie_set = Some(Instant::now());

        tracing::debug!("stored cookie from reply");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::x25519;
    use crate::protocol::messages::{MessageInitiation, INITIATION_SIZE};

    fn raw_initiation() -> Vec<u8> {
        MessageInitiation {
            sender: 0xAABB,
            ephemeral: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn mac1_binds_to_recipient_key() {
        let (_, device_pub) = x25519::generate_keypair();
        let (_, other_pub) = x25519::generate_keypair();

        let checker = CookieChecker::new(&device_pub);
        let mut generator = CookieGenerator::new(&device_pub);
        let mut wrong_generator = CookieGenerator::new(&other_pub);

        let mut msg = raw_initiation();
        generator.add_macs(&mut msg);
        assert!(checker.check_mac1(&msg));

        let mut forged = raw_initiation();
        wrong_generator.add_macs(&mut forged);
        assert!(!checker.check_mac1(&forged));
    }

    #[test]
    fn mac1_detects_bit_flips() {
        let (_, device_pub) = x25519::generate_keypair();
        let checker = CookieChecker::new(&device_pub);
        let mut generator = CookieGenerator::new(&device_pub);

        let mut msg = raw_initiation();
        generator.add_macs(&mut msg);
        msg[10] ^= 1;
        assert!(!checker.check_mac1(&msg));
    }

    #[test]
    fn cookie_reply_enables_mac2() {
        let (_, device_pub) = x25519::generate_keypair();
        let src: SocketAddr = "192.0.2.1:51820".parse().unwrap();

        let mut checker = CookieChecker::new(&device_pub);
        let mut generator = CookieGenerator::new(&device_pub);

        let mut msg = raw_initiation();
        generator.add_macs(&mut msg);
        // no cookie yet, so MAC2 must fail
        assert!(!checker.check_mac2(&msg, &src));

        let reply = checker.create_reply(&msg, 0xAABB, &src).unwrap();
        generator.consume_reply(&reply).unwrap();

        let mut retry = raw_initiation();
        generator.add_macs(&mut retry);
        assert!(checker.check_mac2(&retry, &src));
    }

    #[test]
    fn cookie_is_bound_to_source_address() {
        let (_, device_pub) = x25519::generate_keypair();
        let src: SocketAddr = "192.0.2.1:51820".parse().unwrap();
        let other: SocketAddr = "192.0.2.99:51820".parse().unwrap();

        let mut checker = CookieChecker::new(&device_pub);
        let mut generator = CookieGenerator::new(&device_pub);

        let mut msg = raw_initiation();
        generator.add_macs(&mut msg);
        let reply = checker.create_reply(&msg, 0xAABB, &src).unwrap();
        generator.consume_reply(&reply).unwrap();

        let mut retry = raw_initiation();
        generator.add_macs(&mut retry);
        assert!(checker.check_mac2(&retry, &src));
        assert!(!checker.check_mac2(&retry, &other));
    }

    #[test]
    fn reply_without_prior_initiation_is_rejected() {
        let (_, device_pub) = x25519::generate_keypair();
        let mut generator = CookieGenerator::new(&device_pub);
        let reply = CookieReply {
            receiver: 1,
            nonce: [0u8; 24],
            encrypted_cookie: [0u8; 32],
        };
        assert!(generator.consume_reply(&reply).is_err());
    }

    #[test]
    fn offsets_only_match_handshake_sizes() {
        assert!(mac_offsets(INITIATION_SIZE).is_some());
        assert!(mac_offsets(64).is_none());
        assert!(mac_offsets(0).is_none());
    }
}
