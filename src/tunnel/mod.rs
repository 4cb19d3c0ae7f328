//! Tunnel device abstraction
//!
//! The engine exchanges plaintext IP frames with the host through the
//! [`Tun`] capability trait. The daemon wires in a real TUN device backed
//! by the tun-rs crate; tests use the channel-backed [`MemTun`].

use std::future::Future;

use crate::error::TunnelError;

/// Events the device reacts to: link state and MTU changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunEvent {
    Up,
    Down,
    MtuUpdate(i32),
}

/// Tunnel device capability
pub trait Tun: Send + Sync + 'static {
    /// Current MTU of the interface
    fn mtu(&self) -> i32;

    /// Preferred number of frames per read/write call
    fn batch_size(&self) -> usize;

    /// Read up to `bufs.len()` frames. Each buffer is filled starting at
    /// `offset` (leaving room for the transport header) and truncated to
    /// `offset` plus the frame length. Returns the frame count.
    fn read_batch(
        &self,
        bufs: &mut [Vec<u8>],
        offset: usize,
    ) -> impl Future<Output = Result<usize, TunnelError>> + Send;

    /// Write frames to the host stack; returns how many were written
    fn write_batch(
        &self,
        packets: &[&[u8]],
    ) -> impl Future<Output = Result<usize, TunnelError>> + Send;

    /// Next device event; resolves to None once the device is closed
    fn next_event(&self) -> impl Future<Output = Option<TunEvent>> + Send;

    /// Close the device, waking blocked readers with an error
    fn close(&self);

    /// Interface name for logs
    fn name(&self) -> &str;
}

mod mem;
pub use mem::{MemTun, MemTunHandle};

#[cfg(unix)]
mod os;
#[cfg(unix)]
pub use os::OsTun;
