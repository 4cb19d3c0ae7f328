//! Outbound pipeline
//!
//! One tunnel reader routes plaintext frames to peers and stages them.
//! Staged frames are stamped with a keypair and nonce, then published to
//! the shared encryption pool and, in the same breath, onto the peer's
//! ordered queue. Workers seal batches in parallel; the peer's sequential
//! sender consumes completions in order, so packets leave the bind in
//! nonce order.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::protocol::messages::{write_transport_header, TRANSPORT_HEADER_SIZE};
use crate::protocol::ip;
use crate::net::Bind;
use crate::tunnel::Tun;

use super::peer::Peer;
use super::queue::{EncryptJob, OutboundBatch, OutboundElement, OutboundTicket};
use super::{
    Device, PADDING_MULTIPLE, REJECT_AFTER_MESSAGES, REKEY_AFTER_MESSAGES, REKEY_AFTER_TIME,
};

impl<T: Tun, B: Bind> Device<T, B> {
    /// Queue a handshake initiation toward the peer, debounced by
    /// REKEY_TIMEOUT. `is_retry` keeps the attempt counter alive for the
    /// retransmit schedule.
    pub(crate) async fn send_handshake_initiation(
        &self,
        peer: &Arc<Peer>,
        is_retry: bool,
    ) -> crate::error::Result<()> {
        if !peer.is_running() {
            return Ok(());
        }
        if !is_retry {
            peer.timers
                .handshake_attempts
                .store(0, std::sync::atomic::Ordering::Relaxed);
        }
        if !peer.timers.start_handshake_send() {
            return Ok(());
        }

        tracing::debug!("{peer:?}: sending handshake initiation");
        let msg = self.create_initiation(peer)?;
        let mut bytes = msg.to_bytes();
        peer.cookie.lock().expect("cookie lock").add_macs(&mut bytes);

        let keepalive = peer
            .persistent_keepalive
            .load(std::sync::atomic::Ordering::Relaxed);
        peer.timers.any_authenticated_packet_traversal(keepalive);
        peer.timers.any_authenticated_packet_sent();

        if let Err(e) = self.send_to_peer(peer, &bytes).await {
            tracing::debug!("{peer:?}: failed to send initiation: {e}");
        }
        peer.timers.handshake_initiated();
        Ok(())
    }

    /// Send an empty (keepalive) frame, flushing anything staged with it
    pub(crate) async fn send_keepalive(&self, peer: &Arc<Peer>) {
        if !peer.is_running() {
            return;
        }
        if peer.staged_is_empty() {
            let mut frame = self.pool.get();
            frame.resize(TRANSPORT_HEADER_SIZE, 0);
            if let Some(dropped) = peer.stage(frame) {
                self.pool.put(dropped);
            }
        }
        self.send_staged_packets(peer).await;
    }

    /// Move staged frames into the encryption pipeline.
    ///
    /// Without a usable current keypair the frames stay staged and a
    /// handshake is triggered instead.
    pub(crate) async fn send_staged_packets(&self, peer: &Arc<Peer>) {
        let keypair = match peer.keypairs.current() {
            Some(kp) if !kp.expired() && kp.nonce_watermark() < REJECT_AFTER_MESSAGES => kp,
            _ => {
                let _ = self.send_handshake_initiation(peer, false).await;
                return;
            }
        };

        // nonce assignment and queue publication must not interleave with
        // another staging pass, or the ordered queue would disagree with
        // nonce order
        let _serial = peer.tx_serial.lock().await;

        let staged = peer.take_staged();
        if staged.is_empty() {
            return;
        }

        let mut elems = Vec::with_capacity(staged.len());
        let mut exhausted = Vec::new();
        for buf in staged {
            let nonce = keypair.next_nonce();
            if nonce >= REJECT_AFTER_MESSAGES {
                exhausted.push(buf);
                continue;
            }
            elems.push(OutboundElement {
                buf,
                nonce,
                keypair: keypair.clone(),
            });
        }
        if !exhausted.is_empty() {
            // counter ceiling hit mid-batch; keep the frames for the next
            // session
            peer.restage(exhausted);
            let _ = self.send_handshake_initiation(peer, false).await;
        }
        if elems.is_empty() {
            return;
        }

        if elems
            .iter()
            .any(|e| e.buf.len() > TRANSPORT_HEADER_SIZE)
        {
            peer.timers.data_sent();
        }

        let (done_tx, done_rx) = oneshot::channel();
        if peer.outbound_tx().send(Some(done_rx)).await.is_err() {
            for elem in elems {
                self.pool.put(elem.buf);
            }
            return;
        }
        let job = EncryptJob {
            batch: OutboundBatch { elems },
            done: done_tx,
            mtu: self.mtu() as usize,
        };
        if self.encrypt_tx.send(job).await.is_err() {
            tracing::debug!("{peer:?}: encryption queue closed");
        }
    }
}

/// Plaintext padding: up to the next multiple of 16, capped at the MTU,
/// never below the original length
fn padded_len(len: usize, mtu: usize) -> usize {
    let padded = (len + PADDING_MULTIPLE - 1) & !(PADDING_MULTIPLE - 1);
    padded.min(mtu.max(len))
}

/// Shared-pool encryption worker, one per logical CPU
pub(crate) async fn run_encryption_worker(
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EncryptJob>>>,
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
            let plain_len = elem.buf.len() - TRANSPORT_HEADER_SIZE;
            let padded = padded_len(plain_len, job.mtu);
            elem.buf.resize(TRANSPORT_HEADER_SIZE + padded, 0);
            elem.buf
                .resize(TRANSPORT_HEADER_SIZE + padded + crate::crypto::aead::TAG_LEN, 0);

            match elem
                .keypair
                .send
                .seal_in_place(elem.nonce, &mut elem.buf[TRANSPORT_HEADER_SIZE..])
            {
                Ok(()) => {
                    write_transport_header(
                        &mut elem.buf,
                        elem.keypair.remote_index,
                        elem.nonce,
                    );
                }
                Err(_) => elem.buf.clear(),
            }
        }
        // completing the ticket is what releases the sequential sender
        let _ = job.done.send(job.batch);
    }
}

/// Per-peer sequential sender: consumes completion tickets in FIFO order
/// and hands the wire packets to the bind in one batched call
pub(crate) async fn run_sequential_sender<T: Tun, B: Bind>(
    device: Arc<Device<T, B>>,
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<OutboundTicket>,
) {
    while let Some(ticket) = rx.recv().await {
        let Some(ticket) = ticket else { return };
        let Ok(batch) = ticket.await else { continue };

        if !peer.is_running() {
            for elem in batch.elems {
                device.pool.put(elem.buf);
            }
            continue;
        }
        let Some(endpoint) = peer.endpoint() else {
            tracing::debug!("{peer:?}: no known endpoint, dropping batch");
            for elem in batch.elems {
                device.pool.put(elem.buf);
            }
            continue;
        };

        let packets: Vec<&[u8]> = batch
            .elems
            .iter()
            .filter(|e| !e.buf.is_empty())
            .map(|e| e.buf.as_slice())
            .collect();
        let total: u64 = packets.iter().map(|p| p.len() as u64).sum();

        match device.bind.send_batch(&packets, &endpoint).await {
            Ok(()) => {
                peer.tx_bytes
                    .fetch_add(total, std::sync::atomic::Ordering::Relaxed);
                let keepalive = peer
                    .persistent_keepalive
                    .load(std::sync::atomic::Ordering::Relaxed);
                peer.timers.any_authenticated_packet_traversal(keepalive);
                peer.timers.any_authenticated_packet_sent();
            }
            Err(e) => {
                tracing::debug!("{peer:?}: send failed: {e}");
            }
        }

        // the initiator refreshes the session by age or counter use
        if let Some(keypair) = batch.elems.first().map(|e| e.keypair.clone()) {
            if keypair.is_initiator
                && (keypair.created.elapsed() >= REKEY_AFTER_TIME
                    || keypair.nonce_watermark() >= REKEY_AFTER_MESSAGES)
            {
                let _ = device.send_handshake_initiation(&peer, false).await;
            }
        }

        for elem in batch.elems {
            device.pool.put(elem.buf);
        }
    }
}

/// Tunnel reader: routes host frames to peers via the cryptokey table
pub(crate) async fn run_tun_reader<T: Tun, B: Bind>(device: Arc<Device<T, B>>) {
    let batch_size = device.tun.batch_size().max(1);
    let mut shutdown = device.subscribe_shutdown();
    let mut errors = 0u32;

    loop {
        if device.is_closed() {
            return;
        }
        let mut bufs: Vec<Vec<u8>> = (0..batch_size).map(|_| device.pool.get()).collect();

        let read = tokio::select! {
            read = device.tun.read_batch(&mut bufs, TRANSPORT_HEADER_SIZE) => read,
            _ = shutdown.changed() => return,
        };
        let count = match read {
            Ok(n) => {
                errors = 0;
                n
            }
            Err(e) => {
                for buf in bufs {
                    device.pool.put(buf);
                }
                if device.is_closed() {
                    return;
                }
                errors += 1;
                if errors > 10 {
                    tracing::error!("tunnel read failing persistently, closing device: {e}");
                    // close() joins this task, so it must run elsewhere
                    let device = device.clone();
                    tokio::spawn(async move { device.close().await });
                    return;
                }
                tracing::debug!("tunnel read error (attempt {errors}): {e}");
                tokio::time::sleep(Duration::from_millis(50 * errors as u64)).await;
                continue;
            }
        };

        let mut touched: Vec<Arc<Peer>> = Vec::new();
        for buf in bufs.drain(..count) {
            let frame = &buf[TRANSPORT_HEADER_SIZE..];
            let Some(dst) = ip::destination(frame) else {
                device.pool.put(buf);
                continue;
            };
            let Some(peer) = device.allowed_ips.lookup(&dst) else {
                tracing::trace!("no peer for destination {dst}");
                device.pool.put(buf);
                continue;
            };
            if !peer.is_running() {
                device.pool.put(buf);
                continue;
            }
            if let Some(evicted) = peer.stage(buf) {
                device.pool.put(evicted);
            }
            if !touched.iter().any(|p| Arc::ptr_eq(p, &peer)) {
                touched.push(peer);
            }
        }
        for buf in bufs {
            device.pool.put(buf);
        }

        for peer in touched {
            device.send_staged_packets(&peer).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_rounds_up_to_multiple() {
        assert_eq!(padded_len(0, 1420), 0);
        assert_eq!(padded_len(1, 1420), 16);
        assert_eq!(padded_len(16, 1420), 16);
        assert_eq!(padded_len(17, 1420), 32);
        assert_eq!(padded_len(84, 1420), 96);
    }

    #[test]
    fn padding_is_capped_at_mtu() {
        assert_eq!(padded_len(1419, 1420), 1420);
        // never truncates below the real length
        assert_eq!(padded_len(1425, 1420), 1425);
    }
}
