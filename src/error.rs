//! Error types for the tunguard engine

use thiserror::Error;

/// Main error type for tunguard
#[derive(Error, Debug)]
pub enum TunguardError {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Cryptographic errors
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Resource exhaustion
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Network errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Configuration parsing errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Invalid key: {field}")]
    InvalidKey { field: String },

    #[error("Invalid IP address: {value}")]
    InvalidAddress { value: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or authentication tag")]
    Decryption,

    #[error("Invalid public key")]
    InvalidPublicKey,
}

/// Protocol-level violations. Packets that trigger one are silently
/// dropped; the pipelines keep running.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message type: {msg_type}")]
    InvalidMessageType { msg_type: u32 },

    #[error("Invalid message length: expected {expected}, got {got}")]
    InvalidMessageLength { expected: usize, got: usize },

    #[error("MAC verification failed")]
    MacVerificationFailed,

    #[error("Replay attack detected: counter {counter} already seen")]
    ReplayDetected { counter: u64 },

    #[error("Handshake timestamp replay")]
    TimestampReplay,

    #[error("Handshake initiations too frequent")]
    InitiationFlood,

    #[error("Rate limited")]
    RateLimited,

    #[error("Session expired")]
    SessionExpired,

    #[error("No active session")]
    NoSession,

    #[error("Invalid handshake state transition")]
    InvalidState,

    #[error("Unknown session index: {index}")]
    UnknownIndex { index: u32 },

    #[error("Unknown peer")]
    UnknownPeer,

    #[error("Inner source address not allowed")]
    DisallowedSource,

    #[error("Nonce counter exhausted")]
    NonceExhausted,
}

/// A queue or table hit its configured bound and the drop policy was applied
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("Handshake queue full")]
    HandshakeQueueFull,

    #[error("Staged packet queue overflow")]
    StagedOverflow,

    #[error("Session index space exhausted")]
    IndexExhausted,
}

/// Network-level errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Port in use: {port}")]
    PortInUse { port: u16 },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },

    #[error("Invalid endpoint: {value}")]
    InvalidEndpoint { value: String },

    #[error("Endpoint not set")]
    NoEndpoint,

    #[error("Bind is closed")]
    BindClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel device errors
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to create TUN device: {reason}")]
    CreateFailed { reason: String },

    #[error("TUN read failed: {reason}")]
    ReadFailed { reason: String },

    #[error("TUN write failed: {reason}")]
    WriteFailed { reason: String },

    #[error("TUN device closed")]
    Closed,

    #[error("Insufficient privileges: {message}")]
    InsufficientPrivileges { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunguardError {
    /// Whether the engine keeps running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Tunnel(TunnelError::InsufficientPrivileges { .. }) => false,
            Self::Tunnel(TunnelError::CreateFailed { .. }) => false,
            Self::Tunnel(TunnelError::Closed) => false,
            Self::Network(NetworkError::BindClosed) => false,
            Self::Protocol(_) => true,
            Self::Crypto(_) => true,
            Self::Resource(_) => true,
            Self::Network(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for tunguard operations
pub type Result<T> = std::result::Result<T, TunguardError>;
