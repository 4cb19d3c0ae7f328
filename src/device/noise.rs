//! The Noise_IKpsk2 handshake state machine
//!
//! Per-peer handshake state plus the four protocol operations: creating
//! and consuming initiations and responses, and deriving the session
//! keypair from a terminal state. An operation whose precondition fails
//! returns an error and leaves the state untouched.

use std::time::Instant;

use tai64::Tai64N;
use zeroize::Zeroize;

use crate::crypto::noise::NoiseState;
use crate::crypto::{x25519, Key};
use crate::error::{CryptoError, ProtocolError, TunguardError};
use crate::net::Bind;
use crate::protocol::messages::{MessageInitiation, MessageResponse};
use crate::tunnel::Tun;

use super::keypair::Keypair;
use super::peer::Peer;
use super::{Device, HANDSHAKE_INITIATION_RATE};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    Zeroed,
    InitiationCreated,
    InitiationConsumed,
    ResponseCreated,
    ResponseConsumed,
}

pub(crate) struct Handshake {
    pub state: HandshakeState,
    pub noise: Option<NoiseState>,
    pub ephemeral_private: Key,
    pub local_index: u32,
    pub remote_index: u32,
    pub remote_static: Key,
    pub remote_ephemeral: Key,
    /// DH(device static, peer static), refreshed on identity changes
    pub precomputed_static_static: Key,
    pub preshared_key: Key,
    /// Greatest TAI64N accepted in an initiation from this peer
    pub last_timestamp: [u8; 12],
    pub last_initiation_consumption: Option<Instant>,
}

impl Handshake {
    pub fn new(remote_static: Key) -> Self {
        Self {
            state: HandshakeState::Zeroed,
            noise: None,
            ephemeral_private: [0u8; 32],
            local_index: 0,
            remote_index: 0,
            remote_static,
            remote_ephemeral: [0u8; 32],
            precomputed_static_static: [0u8; 32],
            preshared_key: [0u8; 32],
            last_timestamp: [0u8; 12],
            last_initiation_consumption: None,
        }
    }

    /// Erase in-flight secrets; configuration (peer key, psk) survives
    pub fn clear(&mut self) {
        if let Some(noise) = &mut self.noise {
            noise.chain_key.zeroize();
            noise.hash.zeroize();
        }
        self.noise = None;
        self.ephemeral_private.zeroize();
        self.remote_ephemeral.zeroize();
        self.local_index = 0;
        self.state = HandshakeState::Zeroed;
    }
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.clear();
        self.preshared_key.zeroize();
        self.precomputed_static_static.zeroize();
    }
}

impl<T: Tun, B: Bind> Device<T, B> {
    /// Build a handshake initiation toward `peer` (MACs left blank)
    pub(crate) fn create_initiation(
        &self,
        peer: &Arc<Peer>,
    ) -> Result<MessageInitiation, TunguardError> {
        let identity = self.static_identity.read().expect("identity lock");
        let Some(_private) = identity.private else {
            return Err(ProtocolError::NoSession.into());
        };
        let mut hs = peer.handshake.write().expect("handshake lock");

        if x25519::is_zero(&hs.precomputed_static_static) {
            return Err(CryptoError::InvalidPublicKey.into());
        }

        let mut noise = NoiseState::new(&hs.remote_static);

        // e
        let (eph_private, eph_public) = x25519::generate_keypair();
        noise.mix_hash(&eph_public);
        noise.mix_chain(&eph_public);

        // es, carrying our sealed static key
        let es = x25519::dh(&eph_private, &hs.remote_static);
        let key = noise.mix_key(&es);
        let encrypted_static = noise.seal_and_mix(&key, &identity.public)?;

        // ss, carrying the sealed timestamp
        let key = noise.mix_key(&hs.precomputed_static_static);
        let timestamp = Tai64N::now().to_bytes();
        let encrypted_timestamp = noise.seal_and_mix(&key, &timestamp)?;

        // a fresh wire index replaces whatever handshake was in flight
        if hs.local_index != 0 {
            self.index_table.delete(hs.local_index);
        }
        let local_index = self.index_table.new_index(peer.clone());

        hs.noise = Some(noise);
        hs.ephemeral_private = eph_private;
        hs.local_index = local_index;
        hs.state = HandshakeState::InitiationCreated;

        Ok(MessageInitiation {
            sender: local_index,
            ephemeral: eph_public,
            encrypted_static: encrypted_static
                .try_into()
                .map_err(|_| CryptoError::Encryption)?,
            encrypted_timestamp: encrypted_timestamp
                .try_into()
                .map_err(|_| CryptoError::Encryption)?,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        })
    }

    /// Process a received initiation, identifying and returning the peer
    pub(crate) fn consume_initiation(
        &self,
        msg: &MessageInitiation,
    ) -> Result<Arc<Peer>, TunguardError> {
        let identity = self.static_identity.read().expect("identity lock");
        let Some(private) = identity.private else {
            return Err(ProtocolError::NoSession.into());
        };

        let mut noise = NoiseState::new(&identity.public);
        noise.mix_hash(&msg.ephemeral);
        noise.mix_chain(&msg.ephemeral);

        let es = x25519::dh(&private, &msg.ephemeral);
        let key = noise.mix_key(&es);
        let static_public: Key = noise
            .open_and_mix(&key, &msg.encrypted_static)?
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;

        let peer = self
            .lookup_peer(&static_public)
            .ok_or(ProtocolError::UnknownPeer)?;
        if !peer.is_running() {
            return Err(ProtocolError::UnknownPeer.into());
        }

        let mut hs = peer.handshake.write().expect("handshake lock");

        if x25519::is_zero(&hs.precomputed_static_static) {
            return Err(CryptoError::InvalidPublicKey.into());
        }

        let key = noise.mix_key(&hs.precomputed_static_static);
        let timestamp: [u8; 12] = noise
            .open_and_mix(&key, &msg.encrypted_timestamp)?
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;

        // replay: TAI64N is monotone, so anything not strictly newer is a
        // replayed or reordered initiation
        if timestamp <= hs.last_timestamp {
            return Err(ProtocolError::TimestampReplay.into());
        }
        // flood
        if hs
            .last_initiation_consumption
            .is_some_and(|t| t.elapsed() <= HANDSHAKE_INITIATION_RATE)
        {
            return Err(ProtocolError::InitiationFlood.into());
        }

        hs.noise = Some(noise);
        hs.remote_index = msg.sender;
        hs.remote_ephemeral = msg.ephemeral;
        hs.last_timestamp = timestamp;
        hs.last_initiation_consumption = Some(Instant::now());
        hs.state = HandshakeState::InitiationConsumed;
        drop(hs);

        Ok(peer)
    }

    /// Build the response to a consumed initiation (MACs left blank)
    pub(crate) fn create_response(
        &self,
        peer: &Arc<Peer>,
    ) -> Result<MessageResponse, TunguardError> {
        let mut hs = peer.handshake.write().expect("handshake lock");
        if hs.state != HandshakeState::InitiationConsumed {
            return Err(ProtocolError::InvalidState.into());
        }
        let mut noise = hs.noise.clone().ok_or(ProtocolError::InvalidState)?;

        // e
        let (eph_private, eph_public) = x25519::generate_keypair();
        noise.mix_hash(&eph_public);
        noise.mix_chain(&eph_public);

        // ee, se: folded into the chain without producing AEAD keys
        let ee = x25519::dh(&eph_private, &hs.remote_ephemeral);
        noise.mix_chain(&ee);
        let se = x25519::dh(&eph_private, &hs.remote_static);
        noise.mix_chain(&se);

        // psk
        let key = noise.mix_psk(&hs.preshared_key);
        let encrypted_nothing = noise.seal_and_mix(&key, &[])?;

        if hs.local_index != 0 {
            self.index_table.delete(hs.local_index);
        }
        let local_index = self.index_table.new_index(peer.clone());

        let msg = MessageResponse {
            sender: local_index,
            receiver: hs.remote_index,
            ephemeral: eph_public,
            encrypted_nothing: encrypted_nothing
                .try_into()
                .map_err(|_| CryptoError::Encryption)?,
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };

        hs.noise = Some(noise);
        hs.ephemeral_private = eph_private;
        hs.local_index = local_index;
        hs.state = HandshakeState::ResponseCreated;

        Ok(msg)
    }

    /// Process a received response for a handshake we initiated
    pub(crate) fn consume_response(
        &self,
        msg: &MessageResponse,
    ) -> Result<Arc<Peer>, TunguardError> {
        let entry = self
            .index_table
            .lookup(msg.receiver)
            .ok_or(ProtocolError::UnknownIndex {
                index: msg.receiver,
            })?;
        let peer = entry.peer().clone();

        let identity = self.static_identity.read().expect("identity lock");
        let Some(private) = identity.private else {
            return Err(ProtocolError::NoSession.into());
        };

        let mut hs = peer.handshake.write().expect("handshake lock");
        if hs.state != HandshakeState::InitiationCreated || hs.local_index != msg.receiver {
            return Err(ProtocolError::InvalidState.into());
        }

        // run the mixing on a scratch copy so a forged response cannot
        // corrupt the in-flight state
        let mut noise = hs.noise.clone().ok_or(ProtocolError::InvalidState)?;
        noise.mix_hash(&msg.ephemeral);
        noise.mix_chain(&msg.ephemeral);

        let ee = x25519::dh(&hs.ephemeral_private, &msg.ephemeral);
        noise.mix_chain(&ee);
        let se = x25519::dh(&private, &msg.ephemeral);
        noise.mix_chain(&se);

        let key = noise.mix_psk(&hs.preshared_key);
        noise.open_and_mix(&key, &msg.encrypted_nothing)?;

        hs.noise = Some(noise);
        hs.remote_index = msg.sender;
        hs.state = HandshakeState::ResponseConsumed;
        drop(hs);

        Ok(peer)
    }

    /// Derive the keypair from a terminal handshake state and rotate it
    /// into the peer's slots
    pub(crate) fn begin_symmetric_session(&self, peer: &Arc<Peer>) -> Result<(), TunguardError> {
        let mut hs = peer.handshake.write().expect("handshake lock");

        let noise = hs.noise.as_ref().ok_or(ProtocolError::InvalidState)?;
        let (send_key, recv_key, is_initiator) = match hs.state {
            HandshakeState::ResponseConsumed => {
                let (a, b) = noise.split();
                (a, b, true)
            }
            HandshakeState::ResponseCreated => {
                let (a, b) = noise.split();
                (b, a, false)
            }
            _ => return Err(ProtocolError::InvalidState.into()),
        };

        let keypair = Arc::new(Keypair::new(
            &send_key,
            &recv_key,
            is_initiator,
            hs.local_index,
            hs.remote_index,
        ));

        // chain key, hash, and ephemeral are spent
        hs.clear();
        drop(hs);

        self.index_table
            .swap(keypair.local_index, peer.clone(), keypair.clone());
        for displaced in peer.keypairs.install(keypair) {
            self.index_table.delete(displaced.local_index);
        }

        peer.mark_handshake_complete();
        peer.timers.session_derived();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::net::mem::{MemBind, MemNetwork};
    use crate::tunnel::MemTun;

    struct Node {
        device: Arc<Device<MemTun, MemBind>>,
        /// The other side's record in this device's peer set
        peer: Arc<Peer>,
    }

    async fn node_pair() -> (Node, Node) {
        let network = MemNetwork::new();
        let (a_priv, a_pub) = x25519::generate_keypair();
        let (b_priv, b_pub) = x25519::generate_keypair();

        let make = |private, other_pub| {
            let network = network.clone();
            async move {
                let (tun, _host) = MemTun::new("hs", 1420);
                let device = Device::new(tun, network.bind());
                device.set_private_key(Some(private)).await.unwrap();
                let peer = device.new_peer(other_pub).unwrap();
                peer.start();
                Node { device, peer }
            }
        };
        (make(a_priv, b_pub).await, make(b_priv, a_pub).await)
    }

    #[tokio::test]
    async fn full_handshake_derives_mirrored_keypairs() {
        let (a, b) = node_pair().await;

        let init = a.device.create_initiation(&a.peer).unwrap();
        let consumed = b.device.consume_initiation(&init).unwrap();
        assert!(Arc::ptr_eq(&consumed, &b.peer));

        let resp = b.device.create_response(&b.peer).unwrap();
        b.device.begin_symmetric_session(&b.peer).unwrap();

        let consumed = a.device.consume_response(&resp).unwrap();
        assert!(Arc::ptr_eq(&consumed, &a.peer));
        a.device.begin_symmetric_session(&a.peer).unwrap();

        // initiator installs current immediately; responder parks in next
        let kp_a = a.peer.keypairs.current().expect("initiator has current");
        assert!(kp_a.is_initiator);
        assert!(b.peer.keypairs.current().is_none());
        let kp_b = b
            .peer
            .keypairs
            .by_local_index(kp_a.remote_index)
            .expect("responder parked the keypair");
        assert!(!kp_b.is_initiator);

        // directional keys line up: A seals, B opens
        let mut buf = vec![7u8; 32 + 16];
        kp_a.send.seal_in_place(0, &mut buf).unwrap();
        let len = kp_b.recv.open_in_place(0, &mut buf).unwrap();
        assert_eq!(&buf[..len], &[7u8; 32]);

        // and the other direction
        let mut buf = vec![9u8; 16 + 16];
        kp_b.send.seal_in_place(0, &mut buf).unwrap();
        let len = kp_a.recv.open_in_place(0, &mut buf).unwrap();
        assert_eq!(&buf[..len], &[9u8; 16]);
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected_without_side_effects() {
        let (a, _b) = node_pair().await;

        // responding without a consumed initiation
        assert!(a.device.create_response(&a.peer).is_err());
        assert_eq!(
            a.peer.handshake.read().unwrap().state,
            HandshakeState::Zeroed
        );

        // deriving keys from a non-terminal state
        assert!(a.device.begin_symmetric_session(&a.peer).is_err());
        assert!(a.peer.keypairs.current().is_none());

        // a response referencing an unknown index
        let bogus = crate::protocol::messages::MessageResponse {
            sender: 1,
            receiver: 0xDEAD_BEEF,
            ephemeral: [0u8; 32],
            encrypted_nothing: [0u8; 16],
            mac1: [0u8; 16],
            mac2: [0u8; 16],
        };
        assert!(a.device.consume_response(&bogus).is_err());
    }

    #[tokio::test]
    async fn initiation_replay_and_flood_are_rejected() {
        let (a, b) = node_pair().await;

        let init = a.device.create_initiation(&a.peer).unwrap();
        b.device.consume_initiation(&init).unwrap();

        // byte-identical replay fails the timestamp check
        match b.device.consume_initiation(&init) {
            Err(TunguardError::Protocol(crate::error::ProtocolError::TimestampReplay)) => {}
            other => panic!("expected timestamp replay, got {other:?}"),
        }

        // a fresh initiation inside the rate window fails the flood check
        let retry = a.device.create_initiation(&a.peer).unwrap();
        match b.device.consume_initiation(&retry) {
            Err(TunguardError::Protocol(crate::error::ProtocolError::InitiationFlood)) => {}
            other => panic!("expected flood rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_static_key_is_rejected() {
        let (a, b) = node_pair().await;

        // strip B's knowledge of A
        let key = *b.peer.public_key();
        b.device.remove_peer(&key).await;

        let init = a.device.create_initiation(&a.peer).unwrap();
        assert!(b.device.consume_initiation(&init).is_err());
    }
}
