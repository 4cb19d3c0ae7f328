//! Channel-backed tunnel device for tests
//!
//! The device half is handed to the engine; the [`MemTunHandle`] half
//! stays with the test and plays the host: frames injected through it
//! appear on the engine's read side, frames the engine writes come back
//! out of the handle.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tokio::sync::mpsc;

use super::{Tun, TunEvent};
use crate::error::TunnelError;

pub struct MemTun {
    name: String,
    mtu: AtomicI32,
    /// Kept so close() can wake a blocked reader with a sentinel
    inject_tx: mpsc::UnboundedSender<Vec<u8>>,
    read_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TunEvent>>,
    closed: AtomicBool,
}

/// The host-facing half of a [`MemTun`]
pub struct MemTunHandle {
    inject_tx: mpsc::UnboundedSender<Vec<u8>>,
    event_tx: mpsc::UnboundedSender<TunEvent>,
    out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemTunHandle {
    /// Present a plaintext frame to the engine, as the host would
    pub fn inject(&self, frame: &[u8]) {
        let _ = self.inject_tx.send(frame.to_vec());
    }

    /// Push a device event (link change, MTU update)
    pub fn push_event(&self, event: TunEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Await the next frame the engine delivered to the host stack
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.out_rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.out_rx.try_recv().ok()
    }
}

impl MemTun {
    pub fn new(name: &str, mtu: i32) -> (Self, MemTunHandle) {
        let (inject_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.to_string(),
                mtu: AtomicI32::new(mtu),
                inject_tx: inject_tx.clone(),
                read_rx: tokio::sync::Mutex::new(read_rx),
                write_tx,
                event_rx: tokio::sync::Mutex::new(event_rx),
                closed: AtomicBool::new(false),
            },
            MemTunHandle {
                inject_tx,
                event_tx,
                out_rx,
            },
        )
    }
}

impl Tun for MemTun {
    fn mtu(&self) -> i32 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn batch_size(&self) -> usize {
        8
    }

    async fn read_batch(&self, bufs: &mut [Vec<u8>], offset: usize) -> Result<usize, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        let mut rx = self.read_rx.lock().await;
        let Some(frame) = rx.recv().await else {
            return Err(TunnelError::Closed);
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        bufs[0].clear();
        bufs[0].resize(offset, 0);
        bufs[0].extend_from_slice(&frame);

        let mut count = 1;
        while count < bufs.len() {
            match rx.try_recv() {
                Ok(frame) => {
                    bufs[count].clear();
                    bufs[count].resize(offset, 0);
                    bufs[count].extend_from_slice(&frame);
                    count += 1;
                }
                Err(_) => break,
            }
        }
        Ok(count)
    }

    async fn write_batch(&self, packets: &[&[u8]]) -> Result<usize, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        for packet in packets {
            self.write_tx
                .send(packet.to_vec())
                .map_err(|_| TunnelError::Closed)?;
        }
        Ok(packets.len())
    }

    async fn next_event(&self) -> Option<TunEvent> {
        let event = self.event_rx.lock().await.recv().await;
        if let Some(TunEvent::MtuUpdate(mtu)) = event {
            self.mtu.store(mtu, Ordering::Relaxed);
        }
        event
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // a blocked reader needs a frame to notice the flag
        let _ = self.inject_tx.send(Vec::new());
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_read_write_roundtrip() {
        let (tun, mut host) = MemTun::new("mem0", 1420);
        host.inject(b"frame-1");
        host.inject(b"frame-2");

        let mut bufs = vec![Vec::new(); 4];
        let n = tun.read_batch(&mut bufs, 16).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&bufs[0][16..], b"frame-1");
        assert_eq!(&bufs[1][16..], b"frame-2");

        tun.write_batch(&[b"reply"]).await.unwrap();
        assert_eq!(host.recv().await.unwrap(), b"reply");
    }

    #[tokio::test]
    async fn close_unblocks_reader() {
        let (tun, _host) = MemTun::new("mem0", 1420);
        tun.close();
        let mut bufs = vec![Vec::new(); 1];
        assert!(tun.read_batch(&mut bufs, 0).await.is_err());
    }

    #[tokio::test]
    async fn events_update_mtu() {
        let (tun, host) = MemTun::new("mem0", 1420);
        host.push_event(TunEvent::MtuUpdate(1280));
        assert_eq!(tun.next_event().await, Some(TunEvent::MtuUpdate(1280)));
        assert_eq!(tun.mtu(), 1280);
    }
}
