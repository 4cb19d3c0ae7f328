//! Real TUN device backed by the tun-rs crate

use std::net::Ipv4Addr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tun_rs::{AsyncDevice, DeviceBuilder};

use super::{Tun, TunEvent};
use crate::error::TunnelError;

pub struct OsTun {
    device: AsyncDevice,
    name: String,
    mtu: AtomicI32,
    closed: AtomicBool,
}

impl OsTun {
    /// Create a TUN interface with the given address and MTU
    pub fn create(address: Ipv4Addr, prefix_len: u8, mtu: u16) -> Result<Self, TunnelError> {
        check_privileges();

        let device = DeviceBuilder::new()
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()
            .map_err(|e| TunnelError::CreateFailed {
                reason: e.to_string(),
            })?;

        let name = device
            .deref()
            .name()
            .map_err(|e| TunnelError::CreateFailed {
                reason: format!("failed to get device name: {e}"),
            })?;

        tracing::info!("created TUN device {name} with address {address}/{prefix_len}");

        Ok(Self {
            device,
            name,
            mtu: AtomicI32::new(mtu as i32),
            closed: AtomicBool::new(false),
        })
    }
}

impl Tun for OsTun {
    fn mtu(&self) -> i32 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn batch_size(&self) -> usize {
        1
    }

    async fn read_batch(&self, bufs: &mut [Vec<u8>], offset: usize) -> Result<usize, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Closed);
        }
        let capacity = bufs[0].capacity().max(offset + 1);
        bufs[0].resize(capacity, 0);
        let len = self
            .device
            .recv(&mut bufs[0][offset..])
            .await
            .map_err(|e| TunnelError::ReadFailed {
                reason: e.to_string(),
            })?;
        bufs[0].truncate(offset + len);
        Ok(1)
    }

    async fn write_batch(&self, packets: &[&[u8]]) -> Result<usize, TunnelError> {
        let mut written = 0;
        for packet in packets {
            self.device
                .send(packet)
                .await
                .map_err(|e| TunnelError::WriteFailed {
                    reason: e.to_string(),
                })?;
            written += 1;
        }
        Ok(written)
    }

    async fn next_event(&self) -> Option<TunEvent> {
        // tun-rs exposes no event stream; park until the device is closed
        std::future::pending().await
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn check_privileges() {
    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("running without root; TUN creation may fail");
        tracing::warn!("either run with sudo or grant CAP_NET_ADMIN");
    }
}
