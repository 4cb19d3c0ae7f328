//! Socket-backed bind: one IPv4 and (best effort) one IPv6 socket

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::net::UdpSocket;
use tokio::sync::watch;

use super::{Bind, Endpoint};
use crate::error::NetworkError;

const BATCH_SIZE: usize = 32;

#[derive(Default)]
struct Sockets {
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
}

/// The production [`Bind`] over tokio UDP sockets
pub struct UdpBind {
    sockets: RwLock<Sockets>,
    /// Bumped on every rebind so blocked receivers give up their socket
    generation: watch::Sender<u64>,
    closed: AtomicBool,
    mark: AtomicU32,
}

impl Default for UdpBind {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpBind {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            sockets: RwLock::new(Sockets::default()),
            generation,
            closed: AtomicBool::new(false),
            mark: AtomicU32::new(0),
        }
    }

    fn socket_for_slot(&self, slot: usize) -> Option<Arc<UdpSocket>> {
        let sockets = self.sockets.read().expect("bind lock");
        match slot {
            0 => sockets.v4.clone(),
            _ => sockets.v6.clone(),
        }
    }

    #[cfg(target_os = "linux")]
    fn apply_mark(&self, socket: &UdpSocket) -> Result<(), NetworkError> {
        use std::os::fd::AsRawFd;
        let mark = self.mark.load(Ordering::Relaxed);
        if mark == 0 {
            return Ok(());
        }
        let fd = socket.as_raw_fd();
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_MARK,
                &mark as *const u32 as *const libc::c_void,
                std::mem::size_of::<u32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(NetworkError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_mark(&self, _socket: &UdpSocket) -> Result<(), NetworkError> {
        Ok(())
    }
}

impl Bind for UdpBind {
    async fn open(&self, port: u16) -> Result<u16, NetworkError> {
        // a closed bind may be reopened when the device comes back up
        self.closed.store(false, Ordering::Release);

        let v4 = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetworkError::PortInUse { port }
            } else {
                NetworkError::BindFailed {
                    addr: format!("0.0.0.0:{port}"),
                    reason: e.to_string(),
                }
            }
        })?;
        let actual = v4.local_addr().map(|a| a.port()).unwrap_or(port);
        self.apply_mark(&v4)?;

        // same port on v6 when available; single-stack hosts just skip it
        let v6 = match UdpSocket::bind(("::", actual)).await {
            Ok(sock) => {
                self.apply_mark(&sock)?;
                Some(Arc::new(sock))
            }
            Err(e) => {
                tracing::debug!("IPv6 bind unavailable: {e}");
                None
            }
        };

        {
            let mut sockets = self.sockets.write().expect("bind lock");
            sockets.v4 = Some(Arc::new(v4));
            sockets.v6 = v6;
        }
        self.generation.send_modify(|g| *g += 1);
        Ok(actual)
    }

    fn receivers(&self) -> usize {
        2
    }

    async fn recv_batch(
        &self,
        slot: usize,
        bufs: &mut [Vec<u8>],
        sources: &mut [SocketAddr],
    ) -> Result<usize, NetworkError> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(NetworkError::BindClosed);
            }
            let mut gen_rx = self.generation.subscribe();
            let Some(socket) = self.socket_for_slot(slot) else {
                // no socket for this family yet; park until a rebind
                if gen_rx.changed().await.is_err() {
                    return Err(NetworkError::BindClosed);
                }
                continue;
            };

            let first = bufs[0].capacity();
            bufs[0].resize(first, 0);
            tokio::select! {
                res = socket.recv_from(&mut bufs[0]) => {
                    let (len, src) = res.map_err(|e| NetworkError::ReceiveFailed {
                        reason: e.to_string(),
                    })?;
                    bufs[0].truncate(len);
                    sources[0] = src;

                    // opportunistically drain what is already queued
                    let mut count = 1;
                    while count < bufs.len() {
                        let cap = bufs[count].capacity();
                        bufs[count].resize(cap, 0);
                        match socket.try_recv_from(&mut bufs[count]) {
                            Ok((len, src)) => {
                                bufs[count].truncate(len);
                                sources[count] = src;
                                count += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    return Ok(count);
                }
                _ = gen_rx.changed() => {
                    // rebound underneath us; retry on the fresh socket
                    continue;
                }
            }
        }
    }

    async fn send_batch(
        &self,
        packets: &[&[u8]],
        endpoint: &Endpoint,
    ) -> Result<(), NetworkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::BindClosed);
        }
        let socket = {
            let sockets = self.sockets.read().expect("bind lock");
            match endpoint.dst {
                SocketAddr::V4(_) => sockets.v4.clone(),
                SocketAddr::V6(_) => sockets.v6.clone().or_else(|| sockets.v4.clone()),
            }
        }
        .ok_or(NetworkError::NoEndpoint)?;

        for packet in packets {
            socket
                .send_to(packet, endpoint.dst)
                .await
                .map_err(|e| NetworkError::SendFailed {
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn set_mark(&self, mark: u32) -> Result<(), NetworkError> {
        self.mark.store(mark, Ordering::Relaxed);
        let sockets = self.sockets.read().expect("bind lock");
        for socket in [&sockets.v4, &sockets.v6].into_iter().flatten() {
            self.apply_mark(socket)?;
        }
        Ok(())
    }

    fn batch_size(&self) -> usize {
        BATCH_SIZE
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut sockets = self.sockets.write().expect("bind lock");
        sockets.v4 = None;
        sockets.v6 = None;
        // wake parked receivers so they observe the closed flag
        self.generation.send_modify(|g| *g += 1);
    }
}
