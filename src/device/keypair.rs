//! Session keypairs and the previous/current/next rotation
//!
//! A keypair is born from one completed handshake: two directional AEAD
//! instances, a monotonically increasing send counter, and a replay
//! filter for the receive side. Only `current` may encrypt; `previous`
//! lingers so packets in flight across a rekey still decrypt; `next` is
//! the responder's parking slot until the initiator proves possession by
//! sending under it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use crate::crypto::aead::TransportCipher;
use crate::crypto::Key;
use crate::protocol::replay::ReplayWindow;

use super::REJECT_AFTER_TIME;

pub struct Keypair {
    pub send: TransportCipher,
    pub recv: TransportCipher,
    send_nonce: AtomicU64,
    pub replay: Mutex<ReplayWindow>,
    pub created: Instant,
    pub is_initiator: bool,
    pub local_index: u32,
    pub remote_index: u32,
}

impl Keypair {
    pub fn new(
        send_key: &Key,
        recv_key: &Key,
        is_initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        Self {
            send: TransportCipher::new(send_key),
            recv: TransportCipher::new(recv_key),
            send_nonce: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::new()),
            created: Instant::now(),
            is_initiator,
            local_index,
            remote_index,
        }
    }

    /// Claim the next send counter. Atomic, so concurrent encrypters
    /// sharing the keypair never collide.
    pub fn next_nonce(&self) -> u64 {
        self.send_nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Current counter value without claiming it
    pub fn nonce_watermark(&self) -> u64 {
        self.send_nonce.load(Ordering::Relaxed)
    }

    /// Hard age expiry
    pub fn expired(&self) -> bool {
        self.created.elapsed() >= REJECT_AFTER_TIME
    }

    #[cfg(test)]
    pub fn for_tests(local_index: u32, remote_index: u32) -> Self {
        Self::new(&[0u8; 32], &[1u8; 32], true, local_index, remote_index)
    }
}

#[derive(Default)]
struct Slots {
    previous: Option<Arc<Keypair>>,
    current: Option<Arc<Keypair>>,
    next: Option<Arc<Keypair>>,
}

/// The three keypair slots of one peer
#[derive(Default)]
pub struct Keypairs {
    slots: RwLock<Slots>,
}

impl Keypairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// The only keypair eligible for sending
    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.slots.read().expect("keypairs lock").current.clone()
    }

    /// Install a freshly derived keypair.
    ///
    /// The initiator takes it live immediately: old current demotes to
    /// previous and any parked next dies. The responder parks it in next
    /// until the first authentic inbound transport packet promotes it.
    /// Returns the keypairs displaced entirely, so the caller can drop
    /// their indices.
    pub fn install(&self, keypair: Arc<Keypair>) -> Vec<Arc<Keypair>> {
        let mut slots = self.slots.write().expect("keypairs lock");
        let mut dropped = Vec::new();

        if let Some(prev) = slots.previous.take() {
            dropped.push(prev);
        }
        if keypair.is_initiator {
            if let Some(next) = slots.next.take() {
                dropped.push(next);
            }
            slots.previous = slots.current.take();
            slots.current = Some(keypair);
        } else if let Some(old_next) = slots.next.replace(keypair) {
            dropped.push(old_next);
        }
        dropped
    }

    /// Rotation hook for authenticated receives: the first packet opened
    /// under `next` promotes it to current. Returns whether a promotion
    /// happened and anything displaced by it.
    pub fn received_with(&self, keypair: &Arc<Keypair>) -> (bool, Vec<Arc<Keypair>>) {
        {
            let slots = self.slots.read().expect("keypairs lock");
            let is_next = slots.next.as_ref().is_some_and(|n| Arc::ptr_eq(n, keypair));
            if !is_next {
                return (false, Vec::new());
            }
        }

        let mut slots = self.slots.write().expect("keypairs lock");
        let is_next = slots.next.as_ref().is_some_and(|n| Arc::ptr_eq(n, keypair));
        if !is_next {
            return (false, Vec::new());
        }

        let mut dropped = Vec::new();
        if let Some(prev) = slots.previous.take() {
            dropped.push(prev);
        }
        slots.previous = slots.current.take();
        slots.current = slots.next.take();
        (true, dropped)
    }

    /// Look up a keypair of this peer by its local index; used to accept
    /// late packets under previous and first packets under next.
    pub fn by_local_index(&self, index: u32) -> Option<Arc<Keypair>> {
        let slots = self.slots.read().expect("keypairs lock");
        let found = [&slots.current, &slots.previous, &slots.next]
            .into_iter()
            .flatten()
            .find(|kp| kp.local_index == index)
            .cloned();
        found
    }

    /// Discard all key material, returning it for index cleanup
    pub fn zero(&self) -> Vec<Arc<Keypair>> {
        let mut slots = self.slots.write().expect("keypairs lock");
        [slots.previous.take(), slots.current.take(), slots.next.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kp(local: u32, initiator: bool) -> Arc<Keypair> {
        Arc::new(Keypair::new(&[0u8; 32], &[1u8; 32], initiator, local, local + 1000))
    }

    #[test]
    fn initiator_installs_as_current() {
        let keypairs = Keypairs::new();
        let first = kp(1, true);
        assert!(keypairs.install(first.clone()).is_empty());
        assert!(Arc::ptr_eq(&keypairs.current().unwrap(), &first));

        let second = kp(2, true);
        let dropped = keypairs.install(second.clone());
        assert!(dropped.is_empty(), "previous slot was empty");
        assert!(Arc::ptr_eq(&keypairs.current().unwrap(), &second));
        // first now lives in previous
        assert!(keypairs.by_local_index(1).is_some());

        let third = kp(3, true);
        let dropped = keypairs.install(third);
        assert_eq!(dropped.len(), 1, "old previous displaced");
        assert!(Arc::ptr_eq(&dropped[0], &first));
    }

    #[test]
    fn responder_parks_in_next_until_first_receive() {
        let keypairs = Keypairs::new();
        let old = kp(1, true);
        keypairs.install(old.clone());

        let fresh = kp(2, false);
        keypairs.install(fresh.clone());

        // old current still the sender until promotion
        assert!(Arc::ptr_eq(&keypairs.current().unwrap(), &old));
        assert!(keypairs.by_local_index(2).is_some());

        let (promoted, dropped) = keypairs.received_with(&fresh);
        assert!(promoted);
        assert!(dropped.is_empty());
        assert!(Arc::ptr_eq(&keypairs.current().unwrap(), &fresh));
        // old current retained as previous
        assert!(keypairs.by_local_index(1).is_some());

        // promotion happens exactly once
        let (again, _) = keypairs.received_with(&fresh);
        assert!(!again);
    }

    #[test]
    fn receive_under_current_does_not_rotate() {
        let keypairs = Keypairs::new();
        let current = kp(1, true);
        keypairs.install(current.clone());

        let (promoted, dropped) = keypairs.received_with(&current);
        assert!(!promoted);
        assert!(dropped.is_empty());
        assert!(Arc::ptr_eq(&keypairs.current().unwrap(), &current));
    }

    #[test]
    fn zero_clears_everything() {
        let keypairs = Keypairs::new();
        keypairs.install(kp(1, true));
        keypairs.install(kp(2, true));
        keypairs.install(kp(3, false));

        let dropped = keypairs.zero();
        assert_eq!(dropped.len(), 3);
        assert!(keypairs.current().is_none());
        assert!(keypairs.by_local_index(1).is_none());
    }

    #[test]
    fn nonces_are_distinct_under_contention() {
        let keypair = kp(1, true);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let kp = keypair.clone();
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| kp.next_nonce()).collect::<Vec<u64>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000, "no nonce was handed out twice");
    }
}
