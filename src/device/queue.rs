//! Queue plumbing for the parallel crypto pipelines
//!
//! Packets move through the engine in per-peer batches. A batch is handed
//! to the shared crypto worker pool together with a oneshot completion
//! channel, while the receiving half of that channel is pushed onto the
//! peer's ordered queue. The per-peer sequential worker awaits completions
//! in FIFO order, which restores submission order no matter how the worker
//! pool interleaves. This is the ordering token of the pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::keypair::Keypair;
use super::peer::Peer;

/// Shared encryption/decryption queue depth
pub const QUEUE_CRYPTO_SIZE: usize = 1024;

/// Per-peer ordered queue depth
pub const QUEUE_PEER_SIZE: usize = 1024;

/// Handshake queue depth. Occupancy above 1/8 of this flips the device
/// into the under-load state.
pub const QUEUE_HANDSHAKE_SIZE: usize = 1024;

/// Staged plaintext frames held per peer while no session exists
pub const QUEUE_STAGED_SIZE: usize = 128;

/// Largest datagram / frame buffer the engine handles
pub const MAX_PACKET_SIZE: usize = 65535;

/// One outbound frame.
///
/// `buf` holds transport-header space followed by the plaintext; after
/// encryption it holds the complete wire message.
pub struct OutboundElement {
    pub buf: Vec<u8>,
    pub nonce: u64,
    pub keypair: Arc<Keypair>,
}

/// An ordered group of outbound frames for one peer
pub struct OutboundBatch {
    pub elems: Vec<OutboundElement>,
}

/// One inbound datagram of transport type.
///
/// `buf` holds the full wire message; after decryption the plaintext
/// occupies `buf[TRANSPORT_HEADER_SIZE..][..plain_len]`. A failed open
/// clears `ok` but keeps the element so batch ordering is undisturbed.
pub struct InboundElement {
    pub buf: Vec<u8>,
    pub counter: u64,
    pub keypair: Arc<Keypair>,
    pub endpoint: SocketAddr,
    pub plain_len: usize,
    pub ok: bool,
}

/// An ordered group of inbound transport messages for one peer
pub struct InboundBatch {
    pub peer: Arc<Peer>,
    pub elems: Vec<InboundElement>,
}

/// Work unit for the encryption pool
pub struct EncryptJob {
    pub batch: OutboundBatch,
    pub done: oneshot::Sender<OutboundBatch>,
    pub mtu: usize,
}

/// Work unit for the decryption pool
pub struct DecryptJob {
    pub batch: InboundBatch,
    pub done: oneshot::Sender<InboundBatch>,
}

/// An inbound handshake-class datagram (initiation, response, or cookie
/// reply), queued for the handshake worker pool
pub struct HandshakeJob {
    pub buf: Vec<u8>,
    pub src: SocketAddr,
}

/// Ticket handed to a per-peer sequential worker: resolves to the batch
/// once the crypto pool is done with it. `None` is the shutdown sentinel.
pub type OutboundTicket = Option<oneshot::Receiver<OutboundBatch>>;
pub type InboundTicket = Option<oneshot::Receiver<InboundBatch>>;
