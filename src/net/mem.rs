//! In-memory bind for tests: a process-local "internet" of ports
//!
//! Each opened bind registers a mailbox under its port. Sending delivers
//! straight into the destination mailbox; unknown ports are a black hole,
//! and a port can be deliberately cut to simulate packet loss.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{Bind, Endpoint};
use crate::error::NetworkError;

type Datagram = (Vec<u8>, SocketAddr);

/// The shared fabric connecting [`MemBind`] instances
#[derive(Default)]
pub struct MemNetwork {
    mailboxes: Mutex<HashMap<u16, mpsc::UnboundedSender<Datagram>>>,
    severed: Mutex<HashSet<u16>>,
    taps: Mutex<HashMap<u16, Vec<Datagram>>>,
    next_port: AtomicU16,
}

impl MemNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mailboxes: Mutex::new(HashMap::new()),
            severed: Mutex::new(HashSet::new()),
            taps: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
        })
    }

    /// Start recording every datagram delivered to `port`
    pub fn tap(&self, port: u16) {
        self.taps
            .lock()
            .expect("network lock")
            .insert(port, Vec::new());
    }

    /// Datagrams recorded for a tapped port so far
    pub fn tapped(&self, port: u16) -> Vec<(Vec<u8>, SocketAddr)> {
        self.taps
            .lock()
            .expect("network lock")
            .get(&port)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver a raw datagram, e.g. to replay captured traffic
    pub fn inject(&self, port: u16, data: Vec<u8>, from: SocketAddr) {
        self.deliver(port, (data, from));
    }

    pub fn bind(self: &Arc<Self>) -> MemBind {
        MemBind {
            network: self.clone(),
            port: AtomicU16::new(0),
            rx: tokio::sync::Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Drop all traffic destined to `port` until restored
    pub fn sever(&self, port: u16) {
        self.severed.lock().expect("network lock").insert(port);
    }

    pub fn restore(&self, port: u16) {
        self.severed.lock().expect("network lock").remove(&port);
    }

    fn deliver(&self, port: u16, datagram: Datagram) {
        if self.severed.lock().expect("network lock").contains(&port) {
            return;
        }
        if let Some(record) = self.taps.lock().expect("network lock").get_mut(&port) {
            record.push(datagram.clone());
        }
        if let Some(tx) = self.mailboxes.lock().expect("network lock").get(&port) {
            let _ = tx.send(datagram);
        }
    }
}

/// A [`Bind`] delivering over a [`MemNetwork`]
pub struct MemBind {
    network: Arc<MemNetwork>,
    port: AtomicU16,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    closed: AtomicBool,
}

impl MemBind {
    fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            self.port.load(Ordering::Relaxed),
        )
    }
}

impl Bind for MemBind {
    async fn open(&self, port: u16) -> Result<u16, NetworkError> {
        // reopening after close is allowed; the mailbox is re-registered
        self.closed.store(false, Ordering::Release);
        let port = if port == 0 {
            self.network.next_port.fetch_add(1, Ordering::Relaxed)
        } else {
            port
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut mailboxes = self.network.mailboxes.lock().expect("network lock");
            if mailboxes.contains_key(&port) {
                return Err(NetworkError::PortInUse { port });
            }
            mailboxes.insert(port, tx);
        }
        // drop a previous registration on rebind
        let old = self.port.swap(port, Ordering::Relaxed);
        if old != 0 && old != port {
            self.network
                .mailboxes
                .lock()
                .expect("network lock")
                .remove(&old);
        }
        *self.rx.lock().await = Some(rx);
        Ok(port)
    }

    fn receivers(&self) -> usize {
        1
    }

    async fn recv_batch(
        &self,
        _slot: usize,
        bufs: &mut [Vec<u8>],
        sources: &mut [SocketAddr],
    ) -> Result<usize, NetworkError> {
        let mut guard = self.rx.lock().await;
        let rx = guard.as_mut().ok_or(NetworkError::BindClosed)?;

        let Some((data, src)) = rx.recv().await else {
            return Err(NetworkError::BindClosed);
        };
        bufs[0].clear();
        bufs[0].extend_from_slice(&data);
        sources[0] = src;

        let mut count = 1;
        while count < bufs.len() {
            match rx.try_recv() {
                Ok((data, src)) => {
                    bufs[count].clear();
                    bufs[count].extend_from_slice(&data);
                    sources[count] = src;
                    count += 1;
                }
                Err(_) => break,
            }
        }
        Ok(count)
    }

    async fn send_batch(
        &self,
        packets: &[&[u8]],
        endpoint: &Endpoint,
    ) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::BindClosed);
        }
        let from = self.local_addr();
        for packet in packets {
            self.network
                .deliver(endpoint.dst.port(), (packet.to_vec(), from));
        }
        Ok(())
    }

    fn set_mark(&self, _mark: u32) -> Result<(), NetworkError> {
        Ok(())
    }

    fn batch_size(&self) -> usize {
        16
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let port = self.port.load(Ordering::Relaxed);
        self.network
            .mailboxes
            .lock()
            .expect("network lock")
            .remove(&port);
        // the sender side is gone, so a blocked recv returns None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_flow_between_binds() {
        let network = MemNetwork::new();
        let a = network.bind();
        let b = network.bind();
        let port_a = a.open(0).await.unwrap();
        let port_b = b.open(0).await.unwrap();

        let ep_b = Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port_b));
        a.send_batch(&[b"hello"], &ep_b).await.unwrap();

        let mut bufs = vec![Vec::with_capacity(128); 4];
        let mut sources = vec![ep_b.dst; 4];
        let n = b.recv_batch(0, &mut bufs, &mut sources).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(bufs[0], b"hello");
        assert_eq!(sources[0].port(), port_a);
    }

    #[tokio::test]
    async fn severed_ports_drop_traffic() {
        let network = MemNetwork::new();
        let a = network.bind();
        let b = network.bind();
        a.open(0).await.unwrap();
        let port_b = b.open(0).await.unwrap();
        network.sever(port_b);

        let ep_b = Endpoint::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port_b));
        a.send_batch(&[b"lost"], &ep_b).await.unwrap();
        network.restore(port_b);
        a.send_batch(&[b"kept"], &ep_b).await.unwrap();

        let mut bufs = vec![Vec::with_capacity(128); 2];
        let mut sources = vec![ep_b.dst; 2];
        let n = b.recv_batch(0, &mut bufs, &mut sources).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(bufs[0], b"kept");
    }

    #[tokio::test]
    async fn close_fails_pending_receives() {
        let network = MemNetwork::new();
        let b = network.bind();
        b.open(0).await.unwrap();

        b.close();
        let mut bufs = vec![Vec::with_capacity(16)];
        let mut sources = vec!["0.0.0.0:0".parse().unwrap()];
        // mailbox sender dropped: receive terminates with BindClosed
        let res = b.recv_batch(0, &mut bufs, &mut sources).await;
        assert!(matches!(res, Err(NetworkError::BindClosed)));
    }
}
