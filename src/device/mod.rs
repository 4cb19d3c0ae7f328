//! The tunnel device: identity, peer set, worker pools, and lifecycle
//!
//! A [`Device`] owns everything: the static identity, the peer set, the
//! cryptokey routing table, the session index table, the shared crypto
//! queues and their worker pools, and the cookie/rate-limit machinery.
//! It is parameterized over the tunnel and bind capability traits so the
//! same engine runs over a real TUN/UDP pair or an in-memory harness.

pub mod allowed_ips;
pub mod index;
pub mod keypair;
pub(crate) mod noise;
pub mod peer;
pub mod pool;
pub mod queue;
pub mod ratelimiter;
mod receive;
mod send;
pub(crate) mod timers;
pub mod uapi;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::WireGuardConfig;
use crate::crypto::{x25519, Key};
use crate::error::{NetworkError, Result};
use crate::net::Bind;
use crate::protocol::cookie::CookieChecker;
use crate::tunnel::{Tun, TunEvent};

use allowed_ips::AllowedIps;
use index::IndexTable;
use peer::Peer;
use pool::BufferPool;
use queue::{
    DecryptJob, EncryptJob, HandshakeJob, MAX_PACKET_SIZE, QUEUE_CRYPTO_SIZE,
    QUEUE_HANDSHAKE_SIZE,
};
use ratelimiter::RateLimiter;

/// Initiator-side rekey trigger on the send counter
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;
/// Absolute counter ceiling: 2^64 - 2^13 - 1
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);
/// Initiator-side rekey trigger on keypair age
pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
/// Hard keypair expiry
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);
/// Give-up window for handshake retries
pub const REKEY_ATTEMPT_TIME: Duration = Duration::from_secs(90);
/// Base handshake retransmit interval
pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
/// Passive keepalive delay after an unanswered receive
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Minimum spacing between accepted initiations from one peer
pub const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(50);
/// How long the under-load flag latches once triggered
pub const UNDER_LOAD_AFTER_TIME: Duration = Duration::from_secs(1);
/// Transport padding quantum
pub const PADDING_MULTIPLE: usize = 16;

/// Retransmit attempts before giving up on an exchange
pub(crate) const MAX_TIMER_HANDSHAKES: u32 =
    (REKEY_ATTEMPT_TIME.as_secs() / REKEY_TIMEOUT.as_secs()) as u32 - 1;

const STATE_DOWN: u32 = 0;
const STATE_UP: u32 = 1;
const STATE_CLOSED: u32 = 2;

pub(crate) struct StaticIdentity {
    pub private: Option<Key>,
    pub public: Key,
}

struct NetState {
    port: u16,
    fwmark: u32,
}

pub struct Device<T: Tun, B: Bind> {
    state: AtomicU32,
    pub(crate) tun: T,
    pub(crate) bind: B,
    net: RwLock<NetState>,
    pub(crate) static_identity: RwLock<StaticIdentity>,
    peers: RwLock<HashMap<Key, Arc<Peer>>>,
    pub(crate) index_table: IndexTable,
    pub(crate) allowed_ips: AllowedIps,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) cookie_checker: Mutex<CookieChecker>,
    pub(crate) pool: BufferPool,
    pub(crate) encrypt_tx: mpsc::Sender<EncryptJob>,
    pub(crate) decrypt_tx: mpsc::Sender<DecryptJob>,
    pub(crate) handshake_tx: mpsc::Sender<HandshakeJob>,
    under_load_until: Mutex<Option<Instant>>,
    shutdown: watch::Sender<bool>,
    mtu: AtomicI32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Tun, B: Bind> Device<T, B> {
    /// Build a device over the given tunnel and bind, spawning the worker
    /// pools. The device starts in the down state with no identity.
    pub fn new(tun: T, bind: B) -> Arc<Self> {
        let (encrypt_tx, encrypt_rx) = mpsc::channel(QUEUE_CRYPTO_SIZE);
        let (decrypt_tx, decrypt_rx) = mpsc::channel(QUEUE_CRYPTO_SIZE);
        let (handshake_tx, handshake_rx) = mpsc::channel(QUEUE_HANDSHAKE_SIZE);
        let (shutdown, _) = watch::channel(false);
        let mtu = tun.mtu();

        let device = Arc::new(Self {
            state: AtomicU32::new(STATE_DOWN),
            tun,
            bind,
            net: RwLock::new(NetState { port: 0, fwmark: 0 }),
            static_identity: RwLock::new(StaticIdentity {
                private: None,
                public: [0u8; 32],
            }),
            peers: RwLock::new(HashMap::new()),
            index_table: IndexTable::new(),
            allowed_ips: AllowedIps::new(),
            rate_limiter: Arc::new(RateLimiter::new()),
            cookie_checker: Mutex::new(CookieChecker::new(&[0u8; 32])),
            pool: BufferPool::new(MAX_PACKET_SIZE, 1024),
            encrypt_tx,
            decrypt_tx,
            handshake_tx,
            under_load_until: Mutex::new(None),
            shutdown,
            mtu: AtomicI32::new(mtu),
            tasks: Mutex::new(Vec::new()),
        });

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let encrypt_rx = Arc::new(tokio::sync::Mutex::new(encrypt_rx));
        let decrypt_rx = Arc::new(tokio::sync::Mutex::new(decrypt_rx));
        let handshake_rx = Arc::new(tokio::sync::Mutex::new(handshake_rx));
        {
            let mut tasks = device.tasks.lock().expect("tasks lock");
            for _ in 0..workers {
                tasks.push(tokio::spawn(send::run_encryption_worker(
                    encrypt_rx.clone(),
                    device.subscribe_shutdown(),
                )));
                tasks.push(tokio::spawn(receive::run_decryption_worker(
                    decrypt_rx.clone(),
                    device.subscribe_shutdown(),
                )));
                tasks.push(tokio::spawn(receive::run_handshake_worker(
                    device.clone(),
                    handshake_rx.clone(),
                )));
            }
            tasks.push(tokio::spawn(send::run_tun_reader(device.clone())));
            tasks.push(tokio::spawn(timers::run_timer_loop(device.clone())));
            tasks.push(tokio::spawn(
                device.rate_limiter.clone().run_gc(device.subscribe_shutdown()),
            ));
            tasks.push(tokio::spawn(run_event_loop(device.clone())));
        }

        device
    }

    pub fn is_up(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_UP
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn mtu(&self) -> i32 {
        self.mtu.load(Ordering::Relaxed)
    }

    /// Bring the device up: open the bind, start receive workers, start
    /// peers.
    pub async fn up(self: &Arc<Self>) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => return Err(NetworkError::BindClosed.into()),
            STATE_UP => return Ok(()),
            _ => {}
        }

        let preferred = self.net.read().expect("net lock").port;
        let actual = self.bind.open(preferred).await?;
        self.net.write().expect("net lock").port = actual;
        self.state.store(STATE_UP, Ordering::Release);
        tracing::info!("device up, listening on port {actual}");

        {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            for slot in 0..self.bind.receivers() {
                tasks.push(tokio::spawn(receive::run_udp_receiver(self.clone(), slot)));
            }
        }

        for peer in self.peer_snapshot() {
            peer.start();
            if peer.persistent_keepalive.load(Ordering::Relaxed) > 0 {
                self.send_keepalive(&peer).await;
            }
            self.send_staged_packets(&peer).await;
        }
        Ok(())
    }

    /// Take the device down: stop peers and release the bind. Sessions
    /// are kept; traffic resumes on the next up.
    pub async fn down(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) != STATE_UP {
            return Ok(());
        }
        self.state.store(STATE_DOWN, Ordering::Release);
        tracing::info!("device down");
        for peer in self.peer_snapshot() {
            peer.stop();
        }
        self.bind.close();
        Ok(())
    }

    /// Terminal shutdown: closes the tunnel and bind, stops every peer
    /// and worker, and broadcasts the closed signal.
    pub async fn close(self: &Arc<Self>) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        tracing::info!("device closing");

        // order matters: signal first so pool workers drop their queue
        // receivers, which fails outstanding tickets instead of leaking
        // blocked sequential workers
        let _ = self.shutdown.send(true);
        self.tun.close();
        self.bind.close();

        let peers: Vec<Arc<Peer>> = {
            let mut map = self.peers.write().expect("peers lock");
            map.drain().map(|(_, p)| p).collect()
        };
        for peer in &peers {
            peer.stop();
            self.allowed_ips.remove_all(peer);
            self.expire_peer_sessions(peer);
        }
        for peer in &peers {
            peer.shutdown_queues().await;
        }

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("tasks lock"));
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("device closed");
    }

    /// Replace the static identity. All sessions die, every peer will
    /// rehandshake, and a peer matching the new public key is dropped.
    pub async fn set_private_key(self: &Arc<Self>, private: Option<Key>) -> Result<()> {
        let public = private.as_ref().map(x25519::public_key).unwrap_or([0u8; 32]);
        {
            let mut identity = self.static_identity.write().expect("identity lock");
            if identity.private == private {
                return Ok(());
            }
            identity.private = private;
            identity.public = public;
        }
        self.cookie_checker
            .lock()
            .expect("cookie checker lock")
            .rekey(&public);

        // self-loop prevention
        if private.is_some() {
            if let Some(own) = self.lookup_peer(&public) {
                let key = *own.public_key();
                self.remove_peer(&key).await;
            }
        }

        for peer in self.peer_snapshot() {
            self.expire_peer_sessions(&peer);
            let mut hs = peer.handshake.write().expect("handshake lock");
            hs.precomputed_static_static = private
                .map(|sk| x25519::dh(&sk, peer.public_key()))
                .unwrap_or([0u8; 32]);
        }
        Ok(())
    }

    /// Add (or fetch) a peer by public key and start its sequential
    /// workers
    pub fn new_peer(self: &Arc<Self>, public_key: Key) -> Result<Arc<Peer>> {
        {
            let identity = self.static_identity.read().expect("identity lock");
            if identity.private.is_some() && identity.public == public_key {
                return Err(crate::error::ProtocolError::UnknownPeer.into());
            }
        }
        if let Some(existing) = self.lookup_peer(&public_key) {
            return Ok(existing);
        }

        let peer = Arc::new(Peer::new(public_key));
        {
            let identity = self.static_identity.read().expect("identity lock");
            if let Some(private) = identity.private {
                peer.handshake
                    .write()
                    .expect("handshake lock")
                    .precomputed_static_static = x25519::dh(&private, &public_key);
            }
        }

        let outbound_rx = peer
            .outbound_rx
            .lock()
            .expect("peer queue lock")
            .take()
            .expect("fresh peer has its queues");
        let inbound_rx = peer
            .inbound_rx
            .lock()
            .expect("peer queue lock")
            .take()
            .expect("fresh peer has its queues");
        {
            let mut tasks = self.tasks.lock().expect("tasks lock");
            tasks.push(tokio::spawn(send::run_sequential_sender(
                self.clone(),
                peer.clone(),
                outbound_rx,
            )));
            tasks.push(tokio::spawn(receive::run_sequential_receiver(
                self.clone(),
                peer.clone(),
                inbound_rx,
            )));
        }

        self.peers
            .write()
            .expect("peers lock")
            .insert(public_key, peer.clone());
        if self.is_up() {
            peer.start();
        }
        tracing::info!("{peer:?}: created");
        Ok(peer)
    }

    /// Remove a peer, its routes, and its sessions
    pub async fn remove_peer(&self, public_key: &Key) {
        let removed = self.peers.write().expect("peers lock").remove(public_key);
        if let Some(peer) = removed {
            peer.stop();
            self.allowed_ips.remove_all(&peer);
            self.expire_peer_sessions(&peer);
            for frame in peer.flush_staged() {
                self.pool.put(frame);
            }
            peer.shutdown_queues().await;
            tracing::info!("{peer:?}: removed");
        }
    }

    pub async fn remove_all_peers(&self) {
        let keys: Vec<Key> = self
            .peers
            .read()
            .expect("peers lock")
            .keys()
            .copied()
            .collect();
        for key in keys {
            self.remove_peer(&key).await;
        }
    }

    pub fn lookup_peer(&self, public_key: &Key) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .expect("peers lock")
            .get(public_key)
            .cloned()
    }

    pub(crate) fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .expect("peers lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().expect("peers lock").len()
    }

    /// Destroy a peer's sessions and in-flight handshake
    pub(crate) fn expire_peer_sessions(&self, peer: &Arc<Peer>) {
        for keypair in peer.keypairs.zero() {
            self.index_table.delete(keypair.local_index);
        }
        let mut hs = peer.handshake.write().expect("handshake lock");
        if hs.local_index != 0 {
            self.index_table.delete(hs.local_index);
        }
        hs.clear();
    }

    /// Ship raw bytes to the peer's current endpoint
    pub(crate) async fn send_to_peer(&self, peer: &Arc<Peer>, data: &[u8]) -> Result<()> {
        let endpoint = peer.endpoint().ok_or(NetworkError::NoEndpoint)?;
        self.bind.send_batch(&[data], &endpoint).await?;
        peer.tx_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Under-load check for the cookie subsystem: occupancy of the
    /// handshake queue above 1/8 capacity, latched for a second.
    pub(crate) fn is_under_load(&self) -> bool {
        let queued = QUEUE_HANDSHAKE_SIZE - self.handshake_tx.capacity();
        let now = Instant::now();
        let mut until = self.under_load_until.lock().expect("load lock");
        if queued > QUEUE_HANDSHAKE_SIZE / 8 {
            *until = Some(now + UNDER_LOAD_AFTER_TIME);
            return true;
        }
        match *until {
            Some(t) if now < t => true,
            _ => {
                *until = None;
                false
            }
        }
    }

    /// Preferred listen port; rebinds immediately when up
    pub async fn set_listen_port(&self, port: u16) -> Result<()> {
        self.net.write().expect("net lock").port = port;
        if self.is_up() {
            let actual = self.bind.open(port).await?;
            self.net.write().expect("net lock").port = actual;
        }
        Ok(())
    }

    pub fn listen_port(&self) -> u16 {
        self.net.read().expect("net lock").port
    }

    pub fn set_fwmark(&self, mark: u32) -> Result<()> {
        self.bind.set_mark(mark)?;
        self.net.write().expect("net lock").fwmark = mark;
        Ok(())
    }

    pub fn fwmark(&self) -> u32 {
        self.net.read().expect("net lock").fwmark
    }

    /// Apply a parsed configuration file, as one atomic set transcript
    pub async fn apply_config(self: &Arc<Self>, config: &WireGuardConfig) -> Result<()> {
        self.set_private_key(Some(config.interface.private_key))
            .await?;
        if let Some(port) = config.interface.listen_port {
            self.set_listen_port(port).await?;
        }

        for peer_config in &config.peers {
            let peer = self.new_peer(peer_config.public_key)?;
            if let Some(psk) = peer_config.preshared_key {
                peer.handshake.write().expect("handshake lock").preshared_key = psk;
            }
            if let Some(endpoint) = peer_config.endpoint {
                peer.set_configured_endpoint(crate::net::Endpoint::new(endpoint));
            }
            if let Some(secs) = peer_config.persistent_keepalive {
                peer.persistent_keepalive
                    .store(secs as u32, Ordering::Relaxed);
            }
            for prefix in &peer_config.allowed_ips {
                self.allowed_ips.insert(*prefix, peer.clone());
            }
        }
        Ok(())
    }

    /// Route lookup by destination, for diagnostics
    pub fn peer_for_ip(&self, ip: &IpAddr) -> Option<Arc<Peer>> {
        self.allowed_ips.lookup(ip)
    }
}

/// React to tunnel device events: link state and MTU changes
async fn run_event_loop<T: Tun, B: Bind>(device: Arc<Device<T, B>>) {
    let mut shutdown = device.subscribe_shutdown();
    loop {
        let event = tokio::select! {
            event = device.tun.next_event() => event,
            _ = shutdown.changed() => return,
        };
        match event {
            Some(TunEvent::Up) => {
                if let Err(e) = device.up().await {
                    tracing::error!("failed to bring device up: {e}");
                }
            }
            Some(TunEvent::Down) => {
                let _ = device.down().await;
            }
            Some(TunEvent::MtuUpdate(mtu)) => {
                tracing::info!("tunnel MTU changed to {mtu}");
                device.mtu.store(mtu, Ordering::Relaxed);
            }
            None => return,
        }
    }
}
