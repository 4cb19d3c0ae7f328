//! Text configuration protocol
//!
//! The line-oriented `get=1` / `set=1` protocol spoken by control tools
//! over a local stream socket. Every reply ends with `errno=<i64>` and a
//! blank line; get replies carry the device and per-peer state first.
//! On a failed set, everything applied before the bad line stays
//! applied.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

use crate::crypto::Key;
use crate::error::{NetworkError, TunguardError};
use crate::net::Bind;
use crate::tunnel::Tun;

use super::peer::Peer;
use super::Device;

/// Errno values in the reply line; the numeric mapping is a contract
/// with the control tools.
pub const ERRNO_IO: i64 = -5;
pub const ERRNO_INVALID: i64 = -22;
pub const ERRNO_UNKNOWN: i64 = -55;
pub const ERRNO_PROTOCOL: i64 = -71;
pub const ERRNO_PORT_IN_USE: i64 = -98;

/// A configuration-protocol failure: errno plus context for the log
#[derive(Debug)]
pub struct IpcError {
    pub errno: i64,
    pub message: String,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPC error {}: {}", self.errno, self.message)
    }
}

impl std::error::Error for IpcError {}

fn invalid(message: impl Into<String>) -> IpcError {
    IpcError {
        errno: ERRNO_INVALID,
        message: message.into(),
    }
}

fn parse_key_hex(value: &str) -> Result<Key, IpcError> {
    let bytes = hex::decode(value).map_err(|_| invalid(format!("bad key hex: {value}")))?;
    bytes
        .try_into()
        .map_err(|_| invalid("key must be 32 bytes"))
}

/// Peer block state during a set operation
struct SetPeerContext {
    peer: Option<Arc<Peer>>,
    /// Absorbing sink for a peer matching our own public key
    dummy: bool,
    /// Whether this block created the peer (update_only undoes that)
    created: bool,
    pka_on: bool,
}

impl SetPeerContext {
    fn new() -> Self {
        Self {
            peer: None,
            dummy: false,
            created: false,
            pka_on: false,
        }
    }

    fn current(&self) -> Option<&Arc<Peer>> {
        if self.dummy {
            None
        } else {
            self.peer.as_ref()
        }
    }
}

impl<T: Tun, B: Bind> Device<T, B> {
    /// Serialize the device and peer state in protocol order
    pub fn uapi_get(&self) -> String {
        let mut out = String::new();

        {
            let identity = self.static_identity.read().expect("identity lock");
            if let Some(private) = identity.private {
                out.push_str(&format!("private_key={}\n", hex::encode(private)));
            }
        }
        let port = self.listen_port();
        if port != 0 {
            out.push_str(&format!("listen_port={port}\n"));
        }
        let fwmark = self.fwmark();
        if fwmark != 0 {
            out.push_str(&format!("fwmark={fwmark}\n"));
        }

        for peer in self.peer_snapshot() {
            out.push_str(&format!("public_key={}\n", hex::encode(peer.public_key())));
            {
                let hs = peer.handshake.read().expect("handshake lock");
                out.push_str(&format!(
                    "preshared_key={}\n",
                    hex::encode(hs.preshared_key)
                ));
            }
            out.push_str("protocol_version=1\n");
            if let Some(endpoint) = peer.endpoint() {
                out.push_str(&format!("endpoint={endpoint}\n"));
            }
            let (secs, nanos) = peer.last_handshake();
            out.push_str(&format!("last_handshake_time_sec={secs}\n"));
            out.push_str(&format!("last_handshake_time_nsec={nanos}\n"));
            out.push_str(&format!(
                "tx_bytes={}\n",
                peer.tx_bytes.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "rx_bytes={}\n",
                peer.rx_bytes.load(Ordering::Relaxed)
            ));
            out.push_str(&format!(
                "persistent_keepalive_interval={}\n",
                peer.persistent_keepalive.load(Ordering::Relaxed)
            ));
            for prefix in self.allowed_ips.entries_for(&peer) {
                out.push_str(&format!("allowed_ip={prefix}\n"));
            }
        }
        out
    }

    /// Apply a set transcript (the lines after `set=1`, without the
    /// terminating blank line)
    pub async fn uapi_set(self: &Arc<Self>, transcript: &str) -> Result<(), IpcError> {
        let mut ctx = SetPeerContext::new();
        let mut device_scope = true;

        for line in transcript.lines() {
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(IpcError {
                    errno: ERRNO_PROTOCOL,
                    message: format!("failed to parse line {line:?}"),
                });
            };

            if key == "public_key" {
                device_scope = false;
                self.finish_peer_block(&mut ctx).await;
                self.begin_peer_block(&mut ctx, value)?;
                continue;
            }

            if device_scope {
                self.set_device_line(key, value).await?;
            } else {
                self.set_peer_line(&mut ctx, key, value).await?;
            }
        }
        self.finish_peer_block(&mut ctx).await;
        Ok(())
    }

    async fn set_device_line(self: &Arc<Self>, key: &str, value: &str) -> Result<(), IpcError> {
        match key {
            "private_key" => {
                let private = if value.is_empty() {
                    None
                } else {
                    let key = parse_key_hex(value)?;
                    // an all-zero value also clears the identity
                    (key != [0u8; 32]).then_some(key)
                };
                tracing::debug!("UAPI: updating private key");
                self.set_private_key(private)
                    .await
                    .map_err(|e| invalid(format!("failed to set private key: {e}")))?;
            }
            "listen_port" => {
                let port: u16 = value
                    .parse()
                    .map_err(|_| invalid(format!("failed to parse listen_port: {value}")))?;
                tracing::debug!("UAPI: updating listen port");
                self.set_listen_port(port).await.map_err(|e| match e {
                    TunguardError::Network(NetworkError::PortInUse { .. }) => IpcError {
                        errno: ERRNO_PORT_IN_USE,
                        message: format!("failed to set listen_port: {e}"),
                    },
                    other => invalid(format!("failed to set listen_port: {other}")),
                })?;
            }
            "fwmark" => {
                let mark: u32 = value
                    .parse()
                    .map_err(|_| invalid(format!("invalid fwmark: {value}")))?;
                tracing::debug!("UAPI: updating fwmark");
                self.set_fwmark(mark)
                    .map_err(|e| invalid(format!("failed to update fwmark: {e}")))?;
            }
            "replace_peers" => {
                if value != "true" {
                    return Err(invalid(format!(
                        "failed to set replace_peers, invalid value: {value}"
                    )));
                }
                tracing::debug!("UAPI: removing all peers");
                self.remove_all_peers().await;
            }
            _ => {
                return Err(invalid(format!("invalid UAPI device key: {key}")));
            }
        }
        Ok(())
    }

    fn begin_peer_block(
        self: &Arc<Self>,
        ctx: &mut SetPeerContext,
        value: &str,
    ) -> Result<(), IpcError> {
        let public_key = parse_key_hex(value)?;

        // a peer carrying our own key becomes a silent sink
        let own = {
            let identity = self.static_identity.read().expect("identity lock");
            identity.private.is_some() && identity.public == public_key
        };
        if own {
            ctx.peer = None;
            ctx.dummy = true;
            ctx.created = false;
            return Ok(());
        }

        ctx.dummy = false;
        ctx.created = self.lookup_peer(&public_key).is_none();
        ctx.peer = Some(
            self.new_peer(public_key)
                .map_err(|e| invalid(format!("failed to create peer: {e}")))?,
        );
        Ok(())
    }

    async fn set_peer_line(
        self: &Arc<Self>,
        ctx: &mut SetPeerContext,
        key: &str,
        value: &str,
    ) -> Result<(), IpcError> {
        match key {
            "update_only" => {
                if value != "true" {
                    return Err(invalid(format!(
                        "failed to set update_only, invalid value: {value}"
                    )));
                }
                // peers created by this very block are taken back out
                if ctx.created {
                    if let Some(peer) = ctx.current() {
                        let key = *peer.public_key();
                        self.remove_peer(&key).await;
                    }
                    ctx.peer = None;
                    ctx.dummy = true;
                }
            }
            "remove" => {
                if value != "true" {
                    return Err(invalid(format!(
                        "failed to set remove, invalid value: {value}"
                    )));
                }
                if let Some(peer) = ctx.current() {
                    let key = *peer.public_key();
                    self.remove_peer(&key).await;
                }
                ctx.peer = None;
                ctx.dummy = true;
            }
            "preshared_key" => {
                let psk = parse_key_hex(value)?;
                if let Some(peer) = ctx.current() {
                    tracing::debug!("{peer:?}: UAPI: updating preshared key");
                    peer.handshake.write().expect("handshake lock").preshared_key = psk;
                }
            }
            "endpoint" => {
                let endpoint = self
                    .bind
                    .parse_endpoint(value)
                    .map_err(|e| invalid(format!("failed to set endpoint {value}: {e}")))?;
                if let Some(peer) = ctx.current() {
                    tracing::debug!("{peer:?}: UAPI: updating endpoint");
                    peer.set_configured_endpoint(endpoint);
                }
            }
            "persistent_keepalive_interval" => {
                let secs: u16 = value.parse().map_err(|_| {
                    invalid(format!(
                        "failed to set persistent keepalive interval: {value}"
                    ))
                })?;
                if let Some(peer) = ctx.current() {
                    tracing::debug!("{peer:?}: UAPI: updating persistent keepalive");
                    let old = peer
                        .persistent_keepalive
                        .swap(secs as u32, Ordering::Relaxed);
                    // switching it on warrants an immediate keepalive
                    ctx.pka_on = old == 0 && secs != 0;
                }
            }
            "replace_allowed_ips" => {
                if value != "true" {
                    return Err(invalid(format!(
                        "failed to replace allowedips, invalid value: {value}"
                    )));
                }
                if let Some(peer) = ctx.current() {
                    tracing::debug!("{peer:?}: UAPI: removing all allowedips");
                    self.allowed_ips.remove_all(peer);
                }
            }
            "allowed_ip" => {
                let (add, text) = match value.strip_prefix('-') {
                    Some(rest) => (false, rest),
                    None => (true, value),
                };
                let prefix: ipnet::IpNet = text
                    .parse()
                    .map_err(|_| invalid(format!("failed to set allowed ip: {text}")))?;
                if let Some(peer) = ctx.current() {
                    if add {
                        self.allowed_ips.insert(prefix.trunc(), peer.clone());
                    } else {
                        self.allowed_ips.remove(&prefix.trunc(), peer);
                    }
                }
            }
            "protocol_version" => {
                if value != "1" {
                    return Err(invalid(format!("invalid protocol version: {value}")));
                }
            }
            // read-only status keys, accepted so a get transcript can be
            // replayed into set unchanged
            "last_handshake_time_sec" | "last_handshake_time_nsec" | "tx_bytes" | "rx_bytes" => {}
            _ => {
                return Err(invalid(format!("invalid UAPI peer key: {key}")));
            }
        }
        Ok(())
    }

    /// End of a peer block: kick the configured peer into action
    async fn finish_peer_block(self: &Arc<Self>, ctx: &mut SetPeerContext) {
        let pka_on = ctx.pka_on;
        if let Some(peer) = ctx.peer.take() {
            if !ctx.dummy && self.is_up() {
                peer.start();
                if pka_on {
                    self.send_keepalive(&peer).await;
                }
                self.send_staged_packets(&peer).await;
            }
        }
        ctx.dummy = false;
        ctx.pka_on = false;
    }

    /// Serve one control connection: a loop of get/set operations
    pub async fn handle_uapi<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufStream::new(stream);
        let mut line = String::new();

        loop {
            line.clear();
            match stream.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }

            let errno = match line.as_str() {
                "get=1\n" => {
                    // the get header is followed by its terminating blank
                    line.clear();
                    if stream.read_line(&mut line).await.is_err() || line != "\n" {
                        tracing::error!("trailing data in UAPI get request");
                        ERRNO_INVALID
                    } else {
                        let state = self.uapi_get();
                        if stream.write_all(state.as_bytes()).await.is_err() {
                            return;
                        }
                        0
                    }
                }
                "set=1\n" => {
                    let mut transcript = String::new();
                    loop {
                        line.clear();
                        match stream.read_line(&mut line).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        if line == "\n" {
                            break;
                        }
                        transcript.push_str(&line);
                    }
                    match self.uapi_set(&transcript).await {
                        Ok(()) => 0,
                        Err(e) => {
                            tracing::error!("{e}");
                            e.errno
                        }
                    }
                }
                _ => {
                    tracing::error!("invalid UAPI operation: {}", line.trim_end());
                    return;
                }
            };

            if stream
                .write_all(format!("errno={errno}\n\n").as_bytes())
                .await
                .is_err()
            {
                return;
            }
            if stream.flush().await.is_err() {
                return;
            }
        }
    }
}
