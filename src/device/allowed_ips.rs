//! Cryptokey routing table
//!
//! A path-compressed binary radix trie mapping IP prefixes to peers, with
//! separate roots for IPv4 and IPv6. Nodes live in an arena indexed by
//! u32 handles; each peer's node handles are also kept in a side map so
//! bulk removal and enumeration never walk the whole trie.
//!
//! Nodes carrying a peer are real routes; nodes without one are glue
//! created by splitting and are collapsed again when removal leaves them
//! with a single child.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use ipnet::IpNet;

use crate::crypto::Key;
use crate::device::peer::Peer;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Parent {
    /// Direct child of the per-family root pointer
    Root,
    Node { id: u32, bit: u8 },
}

struct Node {
    /// Prefix bytes, masked to `cidr`; only the first `len` bytes are used
    bits: [u8; 16],
    /// Address length in bytes (4 or 16)
    len: u8,
    cidr: u8,
    bit_at_byte: u8,
    bit_at_shift: u8,
    peer: Option<Arc<Peer>>,
    child: [Option<u32>; 2],
    parent: Parent,
}

impl Node {
    fn new(ip: &[u8], cidr: u8, peer: Option<Arc<Peer>>) -> Self {
        let mut bits = [0u8; 16];
        bits[..ip.len()].copy_from_slice(ip);
        let mut node = Self {
            bits,
            len: ip.len() as u8,
            cidr,
            bit_at_byte: cidr / 8,
            bit_at_shift: 7 - (cidr % 8),
            peer,
            child: [None, None],
            parent: Parent::Root,
        };
        node.mask_self();
        node
    }

    /// Zero every bit past the prefix length
    fn mask_self(&mut self) {
        let len = self.len as usize;
        let cidr = self.cidr as usize;
        for (i, byte) in self.bits[..len].iter_mut().enumerate() {
            let bit_start = i * 8;
            if bit_start >= cidr {
                *byte = 0;
            } else if bit_start + 8 > cidr {
                *byte &= 0xFFu8 << (bit_start + 8 - cidr);
            }
        }
    }

    /// Which subtree an address continues into at this node
    fn choose(&self, ip: &[u8]) -> u8 {
        (ip[self.bit_at_byte as usize] >> self.bit_at_shift) & 1
    }

    fn prefix(&self) -> IpNet {
        match self.len {
            4 => {
                let octets: [u8; 4] = self.bits[..4].try_into().expect("v4 node");
                IpNet::V4(ipnet::Ipv4Net::new(octets.into(), self.cidr).expect("valid cidr"))
            }
            _ => {
                let octets: [u8; 16] = self.bits;
                IpNet::V6(ipnet::Ipv6Net::new(octets.into(), self.cidr).expect("valid cidr"))
            }
        }
    }
}

/// Length of the common bit prefix of two equal-length addresses
fn common_bits(a: &[u8], b: &[u8]) -> u8 {
    let mut total = 0u8;
    for (x, y) in a.iter().zip(b) {
        let diff = x ^ y;
        if diff == 0 {
            total += 8;
        } else {
            return total + diff.leading_zeros() as u8;
        }
    }
    total
}

#[derive(Default)]
struct Table {
    v4: Option<u32>,
    v6: Option<u32>,
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    /// Node handles owned by each peer, keyed by public key
    by_peer: HashMap<Key, Vec<u32>>,
}

impl Table {
    fn alloc(&mut self, node: Node) -> u32 {
        if let Some(id) = self.free.pop() {
            self.nodes[id as usize] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            (self.nodes.len() - 1) as u32
        }
    }

    fn release(&mut self, id: u32) {
        self.nodes[id as usize] = None;
        self.free.push(id);
    }

    fn node(&self, id: u32) -> &Node {
        self.nodes[id as usize].as_ref().expect("live trie node")
    }

    fn node_mut(&mut self, id: u32) -> &mut Node {
        self.nodes[id as usize].as_mut().expect("live trie node")
    }

    fn root(&self, len: usize) -> Option<u32> {
        if len == 4 {
            self.v4
        } else {
            self.v6
        }
    }

    fn set_child(&mut self, len: usize, parent: Parent, id: Option<u32>) {
        match parent {
            Parent::Root => {
                if len == 4 {
                    self.v4 = id;
                } else {
                    self.v6 = id;
                }
            }
            Parent::Node { id: pid, bit } => {
                self.node_mut(pid).child[bit as usize] = id;
            }
        }
    }

    fn link_owner(&mut self, id: u32, peer: &Arc<Peer>) {
        self.by_peer.entry(*peer.public_key()).or_default().push(id);
    }

    fn unlink_owner(&mut self, id: u32, key: &Key) {
        if let Some(ids) = self.by_peer.get_mut(key) {
            ids.retain(|&n| n != id);
            if ids.is_empty() {
                self.by_peer.remove(key);
            }
        }
    }

    /// Deepest node whose prefix covers (ip, cidr); `exact` when the
    /// prefix itself is already present.
    fn placement(&self, ip: &[u8], cidr: u8) -> (Option<u32>, bool) {
        let mut found = None;
        let mut cursor = self.root(ip.len());
        while let Some(id) = cursor {
            let node = self.node(id);
            if node.cidr > cidr || common_bits(&node.bits[..ip.len()], ip) < node.cidr {
                break;
            }
            found = Some(id);
            if node.cidr == cidr {
                return (found, true);
            }
            cursor = node.child[node.choose(ip) as usize];
        }
        (found, false)
    }

    fn insert(&mut self, ip: &[u8], cidr: u8, peer: Arc<Peer>) {
        let len = ip.len();

        let Some(root) = self.root(len) else {
            let id = self.alloc(Node::new(ip, cidr, Some(peer.clone())));
            self.link_owner(id, &peer);
            self.set_child(len, Parent::Root, Some(id));
            return;
        };

        let (found, exact) = self.placement(ip, cidr);
        if exact {
            let id = found.expect("exact placement has a node");
            if let Some(old) = self.node_mut(id).peer.take() {
                let old_key = *old.public_key();
                self.unlink_owner(id, &old_key);
            }
            self.node_mut(id).peer = Some(peer.clone());
            self.link_owner(id, &peer);
            return;
        }

        let new_id = self.alloc(Node::new(ip, cidr, Some(peer.clone())));
        self.link_owner(new_id, &peer);

        let down = match found {
            None => root,
            Some(pid) => {
                let bit = self.node(pid).choose(ip);
                match self.node(pid).child[bit as usize] {
                    Some(d) => d,
                    None => {
                        // free slot directly under the deepest match
                        self.node_mut(new_id).parent = Parent::Node { id: pid, bit };
                        self.node_mut(pid).child[bit as usize] = Some(new_id);
                        return;
                    }
                }
            }
        };

        // where the new prefix and the occupant diverge
        let down_bits = self.node(down).bits;
        let split_cidr = cidr.min(common_bits(&down_bits[..len], ip));

        if split_cidr == cidr {
            // the new node sits above the occupant
            let bit = self.node(new_id).choose(&down_bits[..len]);
            self.node_mut(down).parent = Parent::Node { id: new_id, bit };
            self.node_mut(new_id).child[bit as usize] = Some(down);
            self.attach(len, found, new_id);
            return;
        }

        // otherwise both hang off a fresh glue node at the fork
        let glue_id = self.alloc(Node::new(ip, split_cidr, None));

        let bit = self.node(glue_id).choose(&down_bits[..len]);
        self.node_mut(down).parent = Parent::Node { id: glue_id, bit };
        self.node_mut(glue_id).child[bit as usize] = Some(down);

        let new_bits = self.node(new_id).bits;
        let bit = self.node(glue_id).choose(&new_bits[..len]);
        self.node_mut(new_id).parent = Parent::Node { id: glue_id, bit };
        self.node_mut(glue_id).child[bit as usize] = Some(new_id);

        self.attach(len, found, glue_id);
    }

    /// Hang `id` under `parent` (or the family root)
    fn attach(&mut self, len: usize, parent: Option<u32>, id: u32) {
        match parent {
            None => {
                self.node_mut(id).parent = Parent::Root;
                self.set_child(len, Parent::Root, Some(id));
            }
            Some(pid) => {
                let bits = self.node(id).bits;
                let bit = self.node(pid).choose(&bits[..len]);
                self.node_mut(id).parent = Parent::Node { id: pid, bit };
                self.node_mut(pid).child[bit as usize] = Some(id);
            }
        }
    }

    fn lookup(&self, ip: &[u8]) -> Option<Arc<Peer>> {
        let mut found = None;
        let mut cursor = self.root(ip.len());
        while let Some(id) = cursor {
            let node = self.node(id);
            if common_bits(&node.bits[..ip.len()], ip) < node.cidr {
                break;
            }
            if let Some(peer) = &node.peer {
                found = Some(peer.clone());
            }
            if node.bit_at_byte as usize == ip.len() {
                break;
            }
            cursor = node.child[node.choose(ip) as usize];
        }
        found
    }

    /// Detach a route node, promoting its only child and collapsing a
    /// now-redundant glue parent.
    fn remove_node(&mut self, id: u32) {
        let (key, len) = {
            let node = self.node(id);
            (node.peer.as_ref().map(|p| *p.public_key()), node.len as usize)
        };
        if let Some(key) = key {
            self.unlink_owner(id, &key);
        }
        self.node_mut(id).peer = None;

        let node_children = self.node(id).child;
        if node_children[0].is_some() && node_children[1].is_some() {
            // still a fork: stays behind as glue
            return;
        }

        let child = node_children[0].or(node_children[1]);
        let parent = self.node(id).parent;
        if let Some(c) = child {
            self.node_mut(c).parent = parent;
        }
        self.set_child(len, parent, child);
        self.release(id);

        if child.is_some() {
            return;
        }
        let Parent::Node { id: pid, bit } = parent else {
            return;
        };
        if self.node(pid).peer.is_some() {
            return;
        }

        // the parent was glue and just lost one of its two reasons to exist
        let other = self.node(pid).child[(bit ^ 1) as usize];
        let grandparent = self.node(pid).parent;
        if let Some(o) = other {
            self.node_mut(o).parent = grandparent;
        }
        self.set_child(len, grandparent, other);
        self.release(pid);
    }
}

/// The device's routing table
#[derive(Default)]
pub struct AllowedIps {
    inner: RwLock<Table>,
}

fn prefix_bytes(prefix: &IpNet) -> ([u8; 16], usize, u8) {
    let mut bytes = [0u8; 16];
    let len = match prefix.addr() {
        IpAddr::V4(ip) => {
            bytes[..4].copy_from_slice(&ip.octets());
            4
        }
        IpAddr::V6(ip) => {
            bytes.copy_from_slice(&ip.octets());
            16
        }
    };
    (bytes, len, prefix.prefix_len())
}

fn ip_bytes(ip: &IpAddr) -> ([u8; 16], usize) {
    let mut bytes = [0u8; 16];
    match ip {
        IpAddr::V4(v4) => {
            bytes[..4].copy_from_slice(&v4.octets());
            (bytes, 4)
        }
        IpAddr::V6(v6) => {
            bytes.copy_from_slice(&v6.octets());
            (bytes, 16)
        }
    }
}

impl AllowedIps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `prefix` to `peer`, detaching any previous owner of the same
    /// prefix
    pub fn insert(&self, prefix: IpNet, peer: Arc<Peer>) {
        let (bytes, len, cidr) = prefix_bytes(&prefix);
        let mut table = self.inner.write().expect("allowed-ips lock");
        table.insert(&bytes[..len], cidr, peer);
    }

    /// Remove `prefix` only if it is currently bound to `peer`
    pub fn remove(&self, prefix: &IpNet, peer: &Arc<Peer>) {
        let (bytes, len, cidr) = prefix_bytes(prefix);
        let mut table = self.inner.write().expect("allowed-ips lock");
        let (found, exact) = table.placement(&bytes[..len], cidr);
        if let (Some(id), true) = (found, exact) {
            let owned = table
                .node(id)
                .peer
                .as_ref()
                .is_some_and(|p| Arc::ptr_eq(p, peer));
            if owned {
                table.remove_node(id);
            }
        }
    }

    /// Remove every prefix owned by `peer`; proportional to the peer's own
    /// entry count
    pub fn remove_all(&self, peer: &Arc<Peer>) {
        let mut table = self.inner.write().expect("allowed-ips lock");
        if let Some(ids) = table.by_peer.remove(peer.public_key()) {
            for id in ids {
                table.remove_node(id);
            }
        }
    }

    /// Longest-prefix-match owner of `ip`
    pub fn lookup(&self, ip: &IpAddr) -> Option<Arc<Peer>> {
        let (bytes, len) = ip_bytes(ip);
        let table = self.inner.read().expect("allowed-ips lock");
        table.lookup(&bytes[..len])
    }

    /// All prefixes bound to `peer`, for the control plane
    pub fn entries_for(&self, peer: &Arc<Peer>) -> Vec<IpNet> {
        let table = self.inner.read().expect("allowed-ips lock");
        table
            .by_peer
            .get(peer.public_key())
            .map(|ids| ids.iter().map(|&id| table.node(id).prefix()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::net::Ipv4Addr;

    fn peer(tag: u8) -> Arc<Peer> {
        Arc::new(Peer::new([tag; 32]))
    }

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn longest_prefix_wins() {
        let table = AllowedIps::new();
        let wide = peer(1);
        let narrow = peer(2);
        table.insert(net("10.0.0.0/8"), wide.clone());
        table.insert(net("10.1.0.0/16"), narrow.clone());

        assert!(Arc::ptr_eq(&table.lookup(&addr("10.1.2.3")).unwrap(), &narrow));
        assert!(Arc::ptr_eq(&table.lookup(&addr("10.2.2.3")).unwrap(), &wide));
        assert!(table.lookup(&addr("11.0.0.1")).is_none());
    }

    #[test]
    fn host_routes_and_default_route() {
        let table = AllowedIps::new();
        let host = peer(1);
        let default = peer(2);
        table.insert(net("10.0.0.2/32"), host.clone());
        table.insert(net("0.0.0.0/0"), default.clone());

        assert!(Arc::ptr_eq(&table.lookup(&addr("10.0.0.2")).unwrap(), &host));
        assert!(Arc::ptr_eq(&table.lookup(&addr("8.8.8.8")).unwrap(), &default));
    }

    #[test]
    fn insert_overwrites_same_prefix() {
        let table = AllowedIps::new();
        let first = peer(1);
        let second = peer(2);
        table.insert(net("192.168.0.0/24"), first.clone());
        table.insert(net("192.168.0.0/24"), second.clone());

        assert!(Arc::ptr_eq(&table.lookup(&addr("192.168.0.9")).unwrap(), &second));
        assert!(table.entries_for(&first).is_empty());
        assert_eq!(table.entries_for(&second).len(), 1);
    }

    #[test]
    fn remove_requires_matching_owner() {
        let table = AllowedIps::new();
        let owner = peer(1);
        let stranger = peer(2);
        table.insert(net("10.0.0.0/24"), owner.clone());

        table.remove(&net("10.0.0.0/24"), &stranger);
        assert!(table.lookup(&addr("10.0.0.1")).is_some());

        table.remove(&net("10.0.0.0/24"), &owner);
        assert!(table.lookup(&addr("10.0.0.1")).is_none());
    }

    #[test]
    fn remove_all_is_complete() {
        let table = AllowedIps::new();
        let a = peer(1);
        let b = peer(2);
        table.insert(net("10.0.0.0/8"), a.clone());
        table.insert(net("10.3.0.0/16"), a.clone());
        table.insert(net("10.3.5.0/24"), b.clone());
        table.insert(net("fd00::/64"), a.clone());

        table.remove_all(&a);

        assert!(table.entries_for(&a).is_empty());
        assert!(table.lookup(&addr("10.4.0.1")).is_none());
        assert!(table.lookup(&addr("fd00::1")).is_none());
        // survivor still routes after glue compaction
        assert!(Arc::ptr_eq(&table.lookup(&addr("10.3.5.9")).unwrap(), &b));
    }

    #[test]
    fn v4_and_v6_roots_are_independent() {
        let table = AllowedIps::new();
        let v4 = peer(1);
        let v6 = peer(2);
        table.insert(net("10.0.0.0/8"), v4.clone());
        table.insert(net("fd00::/8"), v6.clone());

        assert!(Arc::ptr_eq(&table.lookup(&addr("10.9.9.9")).unwrap(), &v4));
        assert!(Arc::ptr_eq(&table.lookup(&addr("fd12::1")).unwrap(), &v6));
    }

    /// Reference-model sweep: random inserts and removals must always
    /// agree with a linear longest-prefix scan over the live entries.
    #[test]
    fn matches_reference_model() {
        let mut rng = StdRng::seed_from_u64(0x7261646978);
        let peers: Vec<Arc<Peer>> = (0..8).map(|i| peer(i as u8 + 1)).collect();
        let table = AllowedIps::new();
        let mut model: Vec<(IpNet, usize)> = Vec::new();

        for _ in 0..600 {
            let p_idx = rng.gen_range(0..peers.len());
            let cidr = rng.gen_range(0..=32);
            let raw = Ipv4Addr::from(rng.gen::<u32>());
            let prefix = IpNet::V4(ipnet::Ipv4Net::new(raw, cidr).unwrap().trunc());

            if rng.gen_bool(0.75) {
                table.insert(prefix, peers[p_idx].clone());
                model.retain(|(net, _)| *net != prefix);
                model.push((prefix, p_idx));
            } else {
                table.remove(&prefix, &peers[p_idx]);
                model.retain(|(net, owner)| !(*net == prefix && *owner == p_idx));
            }

            for _ in 0..20 {
                let probe = IpAddr::V4(Ipv4Addr::from(rng.gen::<u32>()));
                let expected = model
                    .iter()
                    .filter(|(net, _)| net.contains(&probe))
                    .max_by_key(|(net, _)| net.prefix_len())
                    .map(|(_, owner)| *owner);
                let got = table.lookup(&probe);
                match (expected, got) {
                    (None, None) => {}
                    (Some(owner), Some(found)) => {
                        assert!(
                            Arc::ptr_eq(&peers[owner], &found),
                            "wrong owner for {probe}"
                        );
                    }
                    (e, g) => panic!("mismatch for {probe}: model {e:?}, trie {:?}", g.is_some()),
                }
            }
        }
    }

    /// After remove_all, the survivors must route exactly like a freshly
    /// built trie.
    #[test]
    fn compaction_preserves_survivors() {
        let mut rng = StdRng::seed_from_u64(42);
        let doomed = peer(1);
        let keep_a = peer(2);
        let keep_b = peer(3);

        let table = AllowedIps::new();
        let mut survivors = Vec::new();
        for _ in 0..200 {
            let cidr = rng.gen_range(1..=32);
            let prefix = IpNet::V4(
                ipnet::Ipv4Net::new(Ipv4Addr::from(rng.gen::<u32>()), cidr)
                    .unwrap()
                    .trunc(),
            );
            match rng.gen_range(0..3) {
                0 => table.insert(prefix, doomed.clone()),
                1 => {
                    table.insert(prefix, keep_a.clone());
                    survivors.retain(|(net, _): &(IpNet, u8)| *net != prefix);
                    survivors.push((prefix, 2));
                }
                _ => {
                    table.insert(prefix, keep_b.clone());
                    survivors.retain(|(net, _)| *net != prefix);
                    survivors.push((prefix, 3));
                }
            }
        }
        // later doomed inserts may have overwritten survivors
        let doomed_nets: std::collections::HashSet<IpNet> =
            table.entries_for(&doomed).into_iter().collect();
        survivors.retain(|(net, _)| !doomed_nets.contains(net));

        table.remove_all(&doomed);

        let fresh = AllowedIps::new();
        for (net, owner) in &survivors {
            let p = if *owner == 2 { keep_a.clone() } else { keep_b.clone() };
            fresh.insert(*net, p);
        }

        for _ in 0..2000 {
            let probe = IpAddr::V4(Ipv4Addr::from(rng.gen::<u32>()));
            let a = table.lookup(&probe).map(|p| *p.public_key());
            let b = fresh.lookup(&probe).map(|p| *p.public_key());
            assert_eq!(a, b, "divergence at {probe}");
        }
    }
}
