//! tunguard - userspace WireGuard tunnel engine
//!
//! A userspace implementation of the WireGuard secure-tunnel protocol:
//! the Noise_IKpsk2 handshake and key rotation state machine, cryptokey
//! routing over a path-compressed radix trie, parallel encrypt/decrypt
//! pipelines with strict per-peer ordering, cookie-based DoS protection,
//! and the text configuration protocol spoken by the standard control
//! tools.
//!
//! The engine is transport-agnostic: the tunnel device and the UDP bind
//! are capability traits chosen at construction, so the same [`Device`]
//! runs over a real TUN/UDP pair in the daemon and over in-memory
//! channels in tests.
//!
//! # Example
//!
//! ```no_run
//! use tunguard::device::Device;
//! use tunguard::net::udp::UdpBind;
//! use tunguard::tunnel::MemTun;
//! use tunguard::WireGuardConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (tun, _host) = MemTun::new("wg0", 1420);
//!     let device = Device::new(tun, UdpBind::new());
//!     let config = WireGuardConfig::from_file("wg0.conf")?;
//!     device.apply_config(&config).await?;
//!     device.up().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod net;
pub mod protocol;
pub mod tunnel;

pub use config::WireGuardConfig;
pub use device::Device;
pub use error::TunguardError;
