//! Wire formats for the four message types
//!
//! All integers are little-endian. The first four bytes of every message
//! hold the type.
//!
//! ```text
//! 1: initiation   (148)  type | sender | ephemeral | enc_static(48) | enc_timestamp(28) | mac1 | mac2
//! 2: response     (92)   type | sender | receiver | ephemeral | enc_nothing(16) | mac1 | mac2
//! 3: cookie reply (64)   type | receiver | nonce(24) | enc_cookie(32)
//! 4: transport    (>=32) type | receiver | counter(8) | ciphertext+tag
//! ```

use crate::error::ProtocolError;

pub const MESSAGE_INITIATION: u32 = 1;
pub const MESSAGE_RESPONSE: u32 = 2;
pub const MESSAGE_COOKIE_REPLY: u32 = 3;
pub const MESSAGE_TRANSPORT: u32 = 4;

pub const INITIATION_SIZE: usize = 148;
pub const RESPONSE_SIZE: usize = 92;
pub const COOKIE_REPLY_SIZE: usize = 64;

/// Transport header: type(4) | receiver(4) | counter(8)
pub const TRANSPORT_HEADER_SIZE: usize = 16;

/// Smallest valid transport message: header plus the AEAD tag of an empty
/// payload (a keepalive)
pub const TRANSPORT_MIN_SIZE: usize = TRANSPORT_HEADER_SIZE + 16;

/// Read the 4-byte little-endian message type
pub fn message_type(data: &[u8]) -> Option<u32> {
    Some(u32::from_le_bytes(data.get(..4)?.try_into().ok()?))
}

/// Handshake initiation (type 1)
#[derive(Debug, Clone)]
pub struct MessageInitiation {
    pub sender: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl MessageInitiation {
    /// Offset where MAC1 starts; everything before it is MAC1's input
    pub const MAC1_OFFSET: usize = 116;
    /// Offset where MAC2 starts; everything before it is MAC2's input
    pub const MAC2_OFFSET: usize = 132;

    pub fn to_bytes(&self) -> [u8; INITIATION_SIZE] {
        let mut buf = [0u8; INITIATION_SIZE];
        buf[..4].copy_from_slice(&MESSAGE_INITIATION.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != INITIATION_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: INITIATION_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            sender: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            ephemeral: data[8..40].try_into().unwrap(),
            encrypted_static: data[40..88].try_into().unwrap(),
            encrypted_timestamp: data[88..116].try_into().unwrap(),
            mac1: data[116..132].try_into().unwrap(),
            mac2: data[132..148].try_into().unwrap(),
        })
    }
}

/// Handshake response (type 2)
#[derive(Debug, Clone)]
pub struct MessageResponse {
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl MessageResponse {
    pub const MAC1_OFFSET: usize = 60;
    pub const MAC2_OFFSET: usize = 76;

    pub fn to_bytes(&self) -> [u8; RESPONSE_SIZE] {
        let mut buf = [0u8; RESPONSE_SIZE];
        buf[..4].copy_from_slice(&MESSAGE_RESPONSE.to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != RESPONSE_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: RESPONSE_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            sender: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            receiver: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            ephemeral: data[12..44].try_into().unwrap(),
            encrypted_nothing: data[44..60].try_into().unwrap(),
            mac1: data[60..76].try_into().unwrap(),
            mac2: data[76..92].try_into().unwrap(),
        })
    }
}

/// Cookie reply (type 3)
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub fn to_bytes(&self) -> [u8; COOKIE_REPLY_SIZE] {
        let mut buf = [0u8; COOKIE_REPLY_SIZE];
        buf[..4].copy_from_slice(&MESSAGE_COOKIE_REPLY.to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != COOKIE_REPLY_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: COOKIE_REPLY_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            receiver: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            nonce: data[8..32].try_into().unwrap(),
            encrypted_cookie: data[32..64].try_into().unwrap(),
        })
    }
}

/// Write a transport header into the first 16 bytes of `buf`
pub fn write_transport_header(buf: &mut [u8], receiver: u32, counter: u64) {
    buf[..4].copy_from_slice(&MESSAGE_TRANSPORT.to_le_bytes());
    buf[4..8].copy_from_slice(&receiver.to_le_bytes());
    buf[8..16].copy_from_slice(&counter.to_le_bytes());
}

/// Parse a transport header, returning (receiver index, counter)
pub fn parse_transport_header(data: &[u8]) -> Result<(u32, u64), ProtocolError> {
    if data.len() < TRANSPORT_MIN_SIZE {
        return Err(ProtocolError::InvalidMessageLength {
            expected: TRANSPORT_MIN_SIZE,
            got: data.len(),
        });
    }
    let receiver = u32::from_le_bytes(data[4..8].try_into().unwrap());
    let counter = u64::from_le_bytes(data[8..16].try_into().unwrap());
    Ok((receiver, counter))
}
