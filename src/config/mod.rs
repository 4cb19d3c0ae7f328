//! Startup configuration
//!
//! Parses standard `[Interface]` / `[Peer]` configuration files. The
//! daemon applies the result through the same code paths the text
//! configuration protocol uses.

mod parser;

pub use parser::{InterfaceConfig, PeerConfig, WireGuardConfig};
