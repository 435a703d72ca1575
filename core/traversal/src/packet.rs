//! Wire codec for peer-to-peer and client-to-rendezvous datagrams
//!
//! # Format
//!
//! ```text
//! ┌──────────┬────────────────────┬──────────────────────────┐
//! │ Type (1B)│ Length (4B, BE)    │ Payload (Length bytes)   │
//! └──────────┴────────────────────┴──────────────────────────┘
//! ```
//!
//! One packet per datagram. No checksum: the UDP checksum covers integrity.

use std::fmt;

use crate::error::PacketError;

// ============================================================================
// Constants
// ============================================================================

/// Length of the packet header (type + length)
pub const HEADER_LEN: usize = 5;

/// Largest UDP payload over IPv4
pub const MAX_PACKET_SIZE: usize = 65507;

/// Largest payload that still fits a single datagram
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_LEN;

// ============================================================================
// Packet Types
// ============================================================================

/// Packet type tag (first byte on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Registration = 1,
    RegistrationAck = 2,
    HolePunch = 3,
    HolePunchResponse = 4,
    HolePunchAck = 5,
    Data = 6,
    KeepAlive = 7,
    Error = 8,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, PacketError> {
        match value {
            1 => Ok(PacketType::Registration),
            2 => Ok(PacketType::RegistrationAck),
            3 => Ok(PacketType::HolePunch),
            4 => Ok(PacketType::HolePunchResponse),
            5 => Ok(PacketType::HolePunchAck),
            6 => Ok(PacketType::Data),
            7 => Ok(PacketType::KeepAlive),
            8 => Ok(PacketType::Error),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Registration => "registration",
            PacketType::RegistrationAck => "registration-ack",
            PacketType::HolePunch => "hole-punch",
            PacketType::HolePunchResponse => "hole-punch-response",
            PacketType::HolePunchAck => "hole-punch-ack",
            PacketType::Data => "data",
            PacketType::KeepAlive => "keep-alive",
            PacketType::Error => "error",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A decoded packet borrowing its payload from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub packet_type: PacketType,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn new(packet_type: PacketType, payload: &'a [u8]) -> Self {
        Packet {
            packet_type,
            payload,
        }
    }

    /// Encode this packet for the wire
    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        serialize(self.packet_type, self.payload)
    }
}

/// Encode a packet: [type][4-byte BE length][payload]
pub fn serialize(packet_type: PacketType, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(packet_type as u8);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);

    Ok(buf)
}

/// Decode a packet from a received datagram
///
/// Bytes past the declared payload length are ignored.
pub fn parse(buf: &[u8]) -> Result<Packet<'_>, PacketError> {
    if buf.len() < HEADER_LEN {
        return Err(PacketError::Incomplete(buf.len()));
    }

    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let available = buf.len() - HEADER_LEN;
    if length > available {
        return Err(PacketError::Truncated {
            declared: length,
            available,
        });
    }

    let packet_type = PacketType::try_from(buf[0])?;

    Ok(Packet {
        packet_type,
        payload: &buf[HEADER_LEN..HEADER_LEN + length],
    })
}

// ============================================================================
// Tests
// ============================================================================
