//! Peer runtime state
//!
//! A peer is owned by the device's peer set and identified by its static
//! public key. Everything here is shared state touched from several
//! workers: the handshake, the keypair slots, the roaming endpoint, the
//! staged-frame queue, and the two ordered queues feeding the peer's
//! sequential sender and receiver.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::crypto::Key;
use crate::net::Endpoint;
use crate::protocol::cookie::CookieGenerator;

use super::keypair::Keypairs;
use super::noise::Handshake;
use super::queue::{InboundTicket, OutboundTicket, QUEUE_PEER_SIZE, QUEUE_STAGED_SIZE};
use super::timers::Timers;

pub struct Peer {
    public_key: Key,
    pub(crate) handshake: RwLock<Handshake>,
    pub(crate) keypairs: Keypairs,
    pub(crate) cookie: Mutex<CookieGenerator>,
    endpoint: Mutex<Option<Endpoint>>,

    running: AtomicBool,
    pub(crate) tx_bytes: AtomicU64,
    pub(crate) rx_bytes: AtomicU64,
    last_handshake_nanos: AtomicU64,
    pub(crate) persistent_keepalive: AtomicU32,
    pub(crate) timers: Timers,

    /// Plaintext frames waiting for a usable keypair
    staged: Mutex<VecDeque<Vec<u8>>>,

    /// Serializes nonce assignment with publication onto the ordered
    /// queue, so batches enter the queue in nonce order
    pub(crate) tx_serial: tokio::sync::Mutex<()>,

    outbound_tx: mpsc::Sender<OutboundTicket>,
    pub(crate) outbound_rx: Mutex<Option<mpsc::Receiver<OutboundTicket>>>,
    inbound_tx: mpsc::Sender<InboundTicket>,
    pub(crate) inbound_rx: Mutex<Option<mpsc::Receiver<InboundTicket>>>,
}

impl Peer {
    pub fn new(public_key: Key) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_PEER_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_PEER_SIZE);
        Self {
            public_key,
            handshake: RwLock::new(Handshake::new(public_key)),
            keypairs: Keypairs::new(),
            cookie: Mutex::new(CookieGenerator::new(&public_key)),
            endpoint: Mutex::new(None),
            running: AtomicBool::new(false),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake_nanos: AtomicU64::new(0),
            persistent_keepalive: AtomicU32::new(0),
            timers: Timers::new(),
            staged: Mutex::new(VecDeque::new()),
            tx_serial: tokio::sync::Mutex::new(()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn public_key(&self) -> &Key {
        &self.public_key
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn start(&self) {
        self.running.store(true, Ordering::Release);
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.timers.clear_all();
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.lock().expect("endpoint lock").clone()
    }

    /// Roaming: any authenticated packet moves the endpoint to its source
    pub(crate) fn set_endpoint(&self, src: SocketAddr) {
        let mut endpoint = self.endpoint.lock().expect("endpoint lock");
        match endpoint.as_mut() {
            Some(ep) if ep.dst == src => {}
            Some(ep) => {
                tracing::debug!("peer endpoint roamed to {src}");
                ep.dst = src;
                ep.clear_src();
            }
            None => *endpoint = Some(Endpoint::new(src)),
        }
    }

    pub(crate) fn set_configured_endpoint(&self, ep: Endpoint) {
        *self.endpoint.lock().expect("endpoint lock") = Some(ep);
    }

    /// Drop the cached source binding so the kernel re-chooses routes
    pub(crate) fn clear_endpoint_src(&self) {
        if let Some(ep) = self.endpoint.lock().expect("endpoint lock").as_mut() {
            ep.clear_src();
        }
    }

    /// Queue a plaintext frame. On overflow the oldest staged frame is
    /// dropped and returned so its buffer can be recycled.
    pub(crate) fn stage(&self, frame: Vec<u8>) -> Option<Vec<u8>> {
        let mut staged = self.staged.lock().expect("staged lock");
        let dropped = if staged.len() >= QUEUE_STAGED_SIZE {
            staged.pop_front()
        } else {
            None
        };
        staged.push_back(frame);
        dropped
    }

    pub(crate) fn take_staged(&self) -> Vec<Vec<u8>> {
        self.staged.lock().expect("staged lock").drain(..).collect()
    }

    pub(crate) fn restage(&self, frames: Vec<Vec<u8>>) {
        let mut staged = self.staged.lock().expect("staged lock");
        for frame in frames {
            staged.push_back(frame);
        }
    }

    pub(crate) fn staged_is_empty(&self) -> bool {
        self.staged.lock().expect("staged lock").is_empty()
    }

    /// Drop everything staged, returning the buffers for recycling
    pub(crate) fn flush_staged(&self) -> Vec<Vec<u8>> {
        self.take_staged()
    }

    pub(crate) fn mark_handshake_complete(&self) {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        self.last_handshake_nanos.store(nanos, Ordering::Relaxed);
    }

    /// (seconds, nanos) of the last completed handshake, unix epoch
    pub fn last_handshake(&self) -> (u64, u64) {
        let nanos = self.last_handshake_nanos.load(Ordering::Relaxed);
        (nanos / 1_000_000_000, nanos % 1_000_000_000)
    }

    pub(crate) fn outbound_tx(&self) -> mpsc::Sender<OutboundTicket> {
        self.outbound_tx.clone()
    }

    pub(crate) fn inbound_tx(&self) -> mpsc::Sender<InboundTicket> {
        self.inbound_tx.clone()
    }

    /// Wake the sequential workers with the shutdown sentinel; used when
    /// the peer is removed or the device closes.
    pub(crate) async fn shutdown_queues(&self) {
        let _ = self.outbound_tx.send(None).await;
        let _ = self.inbound_tx.send(None).await;
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // log peers the way the control tools name them: first bytes of
        // the public key
        write!(
            f,
            "peer({})",
            hex::encode(&self.public_key[..4])
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_drops_oldest_on_overflow() {
        let peer = Peer::new([7u8; 32]);
        for i in 0..QUEUE_STAGED_SIZE {
            assert!(peer.stage(vec![i as u8]).is_none());
        }
        let dropped = peer.stage(vec![0xFF]);
        assert_eq!(dropped, Some(vec![0u8]), "oldest frame evicted");

        let staged = peer.take_staged();
        assert_eq!(staged.len(), QUEUE_STAGED_SIZE);
        assert_eq!(staged[0], vec![1u8]);
        assert_eq!(staged.last().unwrap(), &vec![0xFF]);
    }

    #[test]
    fn endpoint_roams_and_clears_source() {
        let peer = Peer::new([7u8; 32]);
        let mut ep = Endpoint::new("10.0.0.1:1000".parse().unwrap());
        ep.src = Some("192.168.0.1".parse().unwrap());
        peer.set_configured_endpoint(ep);

        // same address: source binding survives
        peer.set_endpoint("10.0.0.1:1000".parse().unwrap());
        assert!(peer.endpoint().unwrap().src.is_some());

        // roamed: source binding is stale and dropped
        peer.set_endpoint("10.9.9.9:2000".parse().unwrap());
        let ep = peer.endpoint().unwrap();
        assert_eq!(ep.dst, "10.9.9.9:2000".parse().unwrap());
        assert_eq!(ep.src, None);
    }

    #[test]
    fn last_handshake_reports_seconds_and_nanos() {
        let peer = Peer::new([7u8; 32]);
        assert_eq!(peer.last_handshake(), (0, 0));
        peer.mark_handshake_complete();
        let (secs, nanos) = peer.last_handshake();
        assert!(secs > 1_700_000_000);
        assert!(nanos < 1_000_000_000);
    }
}
