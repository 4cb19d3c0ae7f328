//! Session index table
//!
//! Maps the 32-bit indices leaked to the wire (handshake sender/receiver
//! fields, transport receiver field) to the in-flight handshake or the
//! established keypair they belong to. Indices are drawn from the system
//! CSPRNG and retried on collision: uniqueness is a correctness invariant
//! because a received index is the only routing information a transport
//! packet carries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::rngs::OsRng;
use rand::RngCore;

use super::keypair::Keypair;
use super::peer::Peer;

/// What a live index currently refers to
#[derive(Clone)]
pub enum IndexEntry {
    /// A handshake in flight for this peer
    Handshake(Arc<Peer>),
    /// An established session
    Keypair {
        peer: Arc<Peer>,
        keypair: Arc<Keypair>,
    },
}

impl IndexEntry {
    pub fn peer(&self) -> &Arc<Peer> {
        match self {
            IndexEntry::Handshake(peer) => peer,
            IndexEntry::Keypair { peer, .. } => peer,
        }
    }
}

#[derive(Default)]
pub struct IndexTable {
    map: RwLock<HashMap<u32, IndexEntry>>,
}

impl IndexTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh unique index for an in-flight handshake
    pub fn new_index(&self, peer: Arc<Peer>) -> u32 {
        let mut map = self.map.write().expect("index lock");
        loop {
            let index = OsRng.next_u32();
            if let std::collections::hash_map::Entry::Vacant(slot) = map.entry(index) {
                slot.insert(IndexEntry::Handshake(peer));
                return index;
            }
        }
    }

    pub fn lookup(&self, index: u32) -> Option<IndexEntry> {
        self.map.read().expect("index lock").get(&index).cloned()
    }

    pub fn delete(&self, index: u32) {
        self.map.write().expect("index lock").remove(&index);
    }

    /// Re-point an index at the keypair its handshake produced
    pub fn swap(&self, index: u32, peer: Arc<Peer>, keypair: Arc<Keypair>) {
        self.map
            .write()
            .expect("index lock")
            .insert(index, IndexEntry::Keypair { peer, keypair });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Arc<Peer> {
        Arc::new(Peer::new([1u8; 32]))
    }

    #[test]
    fn allocated_indices_resolve() {
        let table = IndexTable::new();
        let p = peer();
        let index = table.new_index(p.clone());

        match table.lookup(index) {
            Some(IndexEntry::Handshake(found)) => assert!(Arc::ptr_eq(&found, &p)),
            _ => panic!("expected handshake entry"),
        }

        table.delete(index);
        assert!(table.lookup(index).is_none());
    }

    #[test]
    fn indices_are_unique() {
        let table = IndexTable::new();
        let p = peer();
        let count = 256;
        for _ in 0..count {
            table.new_index(p.clone());
        }
        assert_eq!(table.len(), count);
    }

    #[test]
    fn swap_repoints_to_keypair() {
        let table = IndexTable::new();
        let p = peer();
        let index = table.new_index(p.clone());

        let kp = Arc::new(Keypair::for_tests(index, 7));
        table.swap(index, p.clone(), kp.clone());

        match table.lookup(index) {
            Some(IndexEntry::Keypair { peer, keypair }) => {
                assert!(Arc::ptr_eq(&peer, &p));
                assert!(Arc::ptr_eq(&keypair, &kp));
            }
            _ => panic!("expected keypair entry"),
        }
    }
}
