//! Inbound pipeline
//!
//! One receive worker per bind slot classifies datagrams by their 4-byte
//! type: transport messages are grouped into per-peer batches for the
//! parallel decryption pool, handshake-class messages go to the handshake
//! queue (non-blocking, dropped when full). The per-peer sequential
//! receiver awaits batch completions in order and applies the replay
//! window, the cryptokey source check, and keypair rotation before
//! delivering plaintext to the tunnel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::NetworkError;
use crate::net::{Bind, Endpoint};
use crate::protocol::ip;
use crate::protocol::messages::{
    self, CookieReply, MessageInitiation, MessageResponse, COOKIE_REPLY_SIZE, INITIATION_SIZE,
    MESSAGE_COOKIE_REPLY, MESSAGE_INITIATION, MESSAGE_RESPONSE, MESSAGE_TRANSPORT, RESPONSE_SIZE,
    TRANSPORT_HEADER_SIZE, TRANSPORT_MIN_SIZE,
};
use crate::tunnel::Tun;

use super::index::IndexEntry;
use super::peer::Peer;
use super::queue::{DecryptJob, HandshakeJob, InboundBatch, InboundElement, InboundTicket};
use super::{Device, KEEPALIVE_TIMEOUT, REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_TIMEOUT};

impl<T: Tun, B: Bind> Device<T, B> {
    /// Hand a grouped batch to the decryption pool and the peer's ordered
    /// queue
    async fn dispatch_inbound(&self, batch: InboundBatch) {
        let peer = batch.peer.clone();
        let (done_tx, done_rx) = oneshot::channel();
        if peer.inbound_tx().send(Some(done_rx)).await.is_err() {
            for elem in batch.elems {
                self.pool.put(elem.buf);
            }
            return;
        }
        let job = DecryptJob {
            batch,
            done: done_tx,
        };
        if self.decrypt_tx.send(job).await.is_err() {
            tracing::debug!("decryption queue closed");
        }
    }
}

/// Expected size for a handshake-class message type
fn handshake_message_size(msg_type: u32) -> usize {
    match msg_type {
        MESSAGE_INITIATION => INITIATION_SIZE,
        MESSAGE_RESPONSE => RESPONSE_SIZE,
        _ => COOKIE_REPLY_SIZE,
    }
}

/// Bind receive worker: classify and dispatch datagrams from one slot
pub(crate) async fn run_udp_receiver<T: Tun, B: Bind>(device: Arc<Device<T, B>>, slot: usize) {
    let batch_size = device.bind.batch_size().max(1);
    let mut errors = 0u32;

    loop {
        if device.is_closed() {
            return;
        }
        let mut bufs: Vec<Vec<u8>> = (0..batch_size).map(|_| device.pool.get()).collect();
        let mut sources = vec!["0.0.0.0:0".parse().expect("placeholder addr"); batch_size];

        let count = match device.bind.recv_batch(slot, &mut bufs, &mut sources).await {
            Ok(n) => {
                errors = 0;
                n
            }
            Err(NetworkError::BindClosed) => return,
            Err(e) => {
                for buf in bufs {
                    device.pool.put(buf);
                }
                errors += 1;
                if errors > 10 {
                    tracing::error!("receive slot {slot} failing persistently, stopping: {e}");
                    return;
                }
                tracing::debug!("receive error on slot {slot} (attempt {errors}): {e}");
                tokio::time::sleep(Duration::from_millis(50 * errors as u64)).await;
                continue;
            }
        };

        // consecutive datagrams for the same peer share one batch so the
        // decryption pool works on runs, not single packets
        let mut pending: Option<InboundBatch> = None;

        for (buf, src) in bufs.drain(..count).zip(sources) {
            match messages::message_type(&buf) {
                Some(MESSAGE_TRANSPORT) => {
                    if buf.len() < TRANSPORT_MIN_SIZE {
                        device.pool.put(buf);
                        continue;
                    }
                    let Ok((receiver, counter)) = messages::parse_transport_header(&buf) else {
                        device.pool.put(buf);
                        continue;
                    };
                    let Some(IndexEntry::Keypair { peer, keypair }) =
                        device.index_table.lookup(receiver)
                    else {
                        tracing::trace!("no session for receiver index {receiver:08x}");
                        device.pool.put(buf);
                        continue;
                    };
                    if keypair.expired() || !peer.is_running() {
                        device.pool.put(buf);
                        continue;
                    }

                    let elem = InboundElement {
                        buf,
                        counter,
                        keypair,
                        endpoint: src,
                        plain_len: 0,
                        ok: false,
                    };
                    match &mut pending {
                        Some(batch) if Arc::ptr_eq(&batch.peer, &peer) => {
                            batch.elems.push(elem);
                        }
                        _ => {
                            if let Some(full) = pending.take() {
                                device.dispatch_inbound(full).await;
                            }
                            pending = Some(InboundBatch {
                                peer,
                                elems: vec![elem],
                            });
                        }
                    }
                }
                Some(t @ (MESSAGE_INITIATION | MESSAGE_RESPONSE | MESSAGE_COOKIE_REPLY)) => {
                    if buf.len() != handshake_message_size(t) {
                        device.pool.put(buf);
                        continue;
                    }
                    match device.handshake_tx.try_send(HandshakeJob { buf, src }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(job)) => {
                            tracing::trace!("handshake queue full, dropping message");
                            device.pool.put(job.buf);
                        }
                        Err(mpsc::error::TrySendError::Closed(job)) => {
                            device.pool.put(job.buf);
                        }
                    }
                }
                _ => {
                    tracing::trace!("unknown message type from {src}");
                    device.pool.put(buf);
                }
            }
        }
        for buf in bufs {
            device.pool.put(buf);
        }
        if let Some(full) = pending.take() {
            device.dispatch_inbound(full).await;
        }
    }
}

/// Shared-pool decryption worker, one per logical CPU
pub(crate) async fn run_decryption_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DecryptJob>>>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                job = guard.recv() => job,
                _ = shutdown.changed() => return,
            }
        };
        let Some(mut job) = job else { return };

        for elem in &mut job.batch.elems {
            match elem
                .keypair
                .recv
                .open_in_place(elem.counter, &mut elem.buf[TRANSPORT_HEADER_SIZE..])
            {
                Ok(len) => {
                    elem.plain_len = len;
                    elem.ok = true;
                }
                Err(_) => {
                    // keep the element for ordering, just mark it dead
                    elem.plain_len = 0;
                    elem.ok = false;
                }
            }
        }
        let _ = job.done.send(job.batch);
    }
}

/// Shared-pool handshake worker
pub(crate) async fn run_handshake_worker<T: Tun, B: Bind>(
    device: Arc<Device<T, B>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<HandshakeJob>>>,
) {
    let mut shutdown = device.subscribe_shutdown();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let job = {
            let mut guard = rx.lock().await;
            tokio::select! {
                job = guard.recv() => job,
                _ = shutdown.changed() => return,
            }
        };
        let Some(HandshakeJob { buf, src }) = job else { return };

        match messages::message_type(&buf) {
            Some(MESSAGE_COOKIE_REPLY) => {
                if let Ok(reply) = CookieReply::from_bytes(&buf) {
                    if let Some(entry) = device.index_table.lookup(reply.receiver) {
                        let peer = entry.peer().clone();
                        let result = peer.cookie.lock().expect("cookie lock").consume_reply(&reply);
                        match result {
                            Ok(()) => tracing::debug!("{peer:?}: cookie accepted"),
                            Err(e) => tracing::trace!("{peer:?}: bad cookie reply: {e}"),
                        }
                    }
                }
            }
            Some(t @ (MESSAGE_INITIATION | MESSAGE_RESPONSE)) => {
                handle_handshake(&device, t, &buf, src).await;
            }
            _ => {}
        }
        device.pool.put(buf);
    }
}

async fn handle_handshake<T: Tun, B: Bind>(
    device: &Arc<Device<T, B>>,
    msg_type: u32,
    buf: &[u8],
    src: std::net::SocketAddr,
) {
    // MAC1 gates everything; a miss means the message was not built for
    // our static key
    let mac1_ok = device
        .cookie_checker
        .lock()
        .expect("cookie checker lock")
        .check_mac1(buf);
    if !mac1_ok {
        tracing::trace!("handshake message from {src} failed MAC1");
        return;
    }

    if device.is_under_load() {
        let mac2_ok = device
            .cookie_checker
            .lock()
            .expect("cookie checker lock")
            .check_mac2(buf, &src);
        if !mac2_ok {
            // answer statelessly with a cookie bound to the source
            let Some(sender) = buf
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
            else {
                return;
            };
            let reply = device
                .cookie_checker
                .lock()
                .expect("cookie checker lock")
                .create_reply(buf, sender, &src);
            if let Ok(reply) = reply {
                let _ = device
                    .bind
                    .send_batch(&[&reply.to_bytes()], &Endpoint::new(src))
                    .await;
            }
            return;
        }
        if !device.rate_limiter.allow(src.ip()) {
            tracing::trace!("rate limiting handshakes from {src}");
            return;
        }
    }

    match msg_type {
        MESSAGE_INITIATION => {
            let Ok(msg) = MessageInitiation::from_bytes(buf) else {
                return;
            };
            let peer = match device.consume_initiation(&msg) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::trace!("initiation from {src} rejected: {e}");
                    return;
                }
            };
            peer.set_endpoint(src);
            tracing::debug!("{peer:?}: received handshake initiation");

            let response = match device.create_response(&peer) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!("{peer:?}: failed to create response: {e}");
                    return;
                }
            };
            let mut bytes = response.to_bytes();
            peer.cookie.lock().expect("cookie lock").add_macs(&mut bytes);

            if let Err(e) = device.begin_symmetric_session(&peer) {
                tracing::debug!("{peer:?}: failed to derive keys: {e}");
                return;
            }
            let keepalive = peer.persistent_keepalive.load(Ordering::Relaxed);
            peer.timers.any_authenticated_packet_traversal(keepalive);
            peer.timers.any_authenticated_packet_sent();
            if let Err(e) = device.send_to_peer(&peer, &bytes).await {
                tracing::debug!("{peer:?}: failed to send response: {e}");
            }
        }
        MESSAGE_RESPONSE => {
            let Ok(msg) = MessageResponse::from_bytes(buf) else {
                return;
            };
            let peer = match device.consume_response(&msg) {
                Ok(peer) => peer,
                Err(e) => {
                    tracing::trace!("response from {src} rejected: {e}");
                    return;
                }
            };
            peer.set_endpoint(src);
            tracing::debug!("{peer:?}: handshake complete");

            if let Err(e) = device.begin_symmetric_session(&peer) {
                tracing::debug!("{peer:?}: failed to derive keys: {e}");
                return;
            }
            peer.timers.handshake_complete();
            // confirm the session so the responder can promote it, and
            // flush anything that queued up while we had no keys
            device.send_keepalive(&peer).await;
        }
        _ => {}
    }
}

/// Per-peer sequential receiver: restores order, applies anti-replay and
/// cryptokey routing, and delivers plaintext to the tunnel
pub(crate) async fn run_sequential_receiver<T: Tun, B: Bind>(
    device: Arc<Device<T, B>>,
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<InboundTicket>,
) {
    while let Some(ticket) = rx.recv().await {
        let Some(ticket) = ticket else { return };
        let Ok(mut batch) = ticket.await else { continue };

        if !peer.is_running() {
            for elem in batch.elems {
                device.pool.put(elem.buf);
            }
            continue;
        }

        let mut rx_bytes = 0u64;
        let mut refresh_keypair = None;

        for elem in &mut batch.elems {
            if !elem.ok {
                continue;
            }
            if elem.counter >= REJECT_AFTER_MESSAGES {
                elem.ok = false;
                continue;
            }
            if !elem
                .keypair
                .replay
                .lock()
                .expect("replay lock")
                .update(elem.counter)
            {
                tracing::trace!("{peer:?}: replayed counter {}", elem.counter);
                elem.ok = false;
                continue;
            }

            // first authentic packet under `next` rotates it in
            let (promoted, displaced) = peer.keypairs.received_with(&elem.keypair);
            if promoted {
                tracing::debug!("{peer:?}: new session confirmed");
                peer.timers.handshake_complete();
            }
            for old in displaced {
                device.index_table.delete(old.local_index);
            }

            peer.set_endpoint(elem.endpoint);
            let keepalive = peer.persistent_keepalive.load(Ordering::Relaxed);
            peer.timers.any_authenticated_packet_received();
            peer.timers.any_authenticated_packet_traversal(keepalive);
            refresh_keypair = Some(elem.keypair.clone());

            if elem.plain_len == 0 {
                // keepalive: authenticated, counted, never delivered
                tracing::trace!("{peer:?}: received keepalive");
                rx_bytes += elem.buf.len() as u64;
                elem.ok = false;
                continue;
            }

            let plain = &elem.buf[TRANSPORT_HEADER_SIZE..TRANSPORT_HEADER_SIZE + elem.plain_len];
            let Some(declared) = ip::declared_len(plain) else {
                tracing::trace!("{peer:?}: malformed inner packet");
                elem.ok = false;
                continue;
            };
            let Some(src_ip) = ip::source(plain) else {
                elem.ok = false;
                continue;
            };
            // cryptokey routing: the inner source must belong to the
            // sender, or the packet dies here
            let allowed = device
                .allowed_ips
                .lookup(&src_ip)
                .is_some_and(|owner| Arc::ptr_eq(&owner, &peer));
            if !allowed {
                tracing::trace!("{peer:?}: disallowed inner source {src_ip}");
                elem.ok = false;
                continue;
            }

            elem.plain_len = declared;
            rx_bytes += elem.buf.len() as u64;
            peer.timers.data_received();
        }

        peer.rx_bytes.fetch_add(rx_bytes, Ordering::Relaxed);

        let packets: Vec<&[u8]> = batch
            .elems
            .iter()
            .filter(|e| e.ok && e.plain_len > 0)
            .map(|e| &e.buf[TRANSPORT_HEADER_SIZE..TRANSPORT_HEADER_SIZE + e.plain_len])
            .collect();
        if !packets.is_empty() {
            if let Err(e) = device.tun.write_batch(&packets).await {
                tracing::debug!("{peer:?}: tunnel write failed: {e}");
            }
        }

        // approaching hard expiry with live traffic: the initiator slips
        // in one final refresh handshake
        if let Some(keypair) = refresh_keypair {
            let refresh_at = REJECT_AFTER_TIME - KEEPALIVE_TIMEOUT - REKEY_TIMEOUT;
            if keypair.is_initiator
                && keypair.created.elapsed() >= refresh_at
                && !peer
                    .timers
                    .sent_last_minute_handshake
                    .swap(true, Ordering::Relaxed)
            {
                let _ = device.send_handshake_initiation(&peer, false).await;
            }
        }

        for elem in batch.elems {
            device.pool.put(elem.buf);
        }
    }
}
