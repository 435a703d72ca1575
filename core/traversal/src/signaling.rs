//! Rendezvous messages between peers and the rendezvous server
//!
//! ```text
//! Peer A                 Rendezvous                 Peer B
//!   │── Register ───────────►│◄────────── Register ───│
//!   │◄─ Registered(obs A) ───│─── Registered(obs B) ─►│
//!   │                        │                        │
//!   │── Connect(A→B) ───────►│                        │
//!   │◄─ Introduce(B, obs B) ─│─── Introduce(A, obs A)►│
//!   │                        │                        │
//!   │◄════════ hole punch / simultaneous open ═══════►│
//!   │── Report(established) ►│◄─ Report(established) ─│
//! ```
//!
//! Each message is bincode-encoded and carried as the payload of one codec
//! packet whose type is fixed per variant, so a receiver can dispatch on the
//! packet type before decoding.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::PacketError;
use crate::packet::{self, PacketType};
use crate::registry::ConnectionStatus;

/// Messages exchanged with the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendezvousMessage {
    /// Peer announces itself
    Register { peer_id: String },

    /// Server confirms registration with the address it saw the peer from
    Registered {
        peer_id: String,
        observed_addr: SocketAddr,
    },

    /// Peer asks to be connected to `target_id`
    Connect { source_id: String, target_id: String },

    /// Server tells each side about the other
    Introduce {
        connection_id: String,
        peer_id: String,
        /// Address the server observed for `peer_id`
        peer_addr: SocketAddr,
        /// Whether the receiver sent the `Connect`
        initiator: bool,
    },

    /// Peer reports the outcome of a traversal
    Report {
        connection_id: String,
        status: ConnectionStatus,
        error: Option<String>,
    },

    Error { message: String },
}

impl RendezvousMessage {
    /// Packet type that carries this message
    pub fn packet_type(&self) -> PacketType {
        match self {
            RendezvousMessage::Register { .. } => PacketType::Registration,
            RendezvousMessage::Registered { .. } => PacketType::RegistrationAck,
            RendezvousMessage::Connect { .. } => PacketType::HolePunch,
            RendezvousMessage::Introduce { .. } => PacketType::HolePunchResponse,
            RendezvousMessage::Report { .. } => PacketType::Data,
            RendezvousMessage::Error { .. } => PacketType::Error,
        }
    }
}

/// Encode a message into a framed packet
pub fn encode(msg: &RendezvousMessage) -> Result<Vec<u8>, PacketError> {
    let payload = bincode::serialize(msg).map_err(|e| PacketError::Malformed(e.to_string()))?;
    packet::serialize(msg.packet_type(), &payload)
}

/// Decode a framed packet into a message
///
/// Fails if the payload does not decode, or decodes to a variant that is not
/// carried by the packet's type.
pub fn decode(buf: &[u8]) -> Result<RendezvousMessage, PacketError> {
    let packet = packet::parse(buf)?;

    let msg: RendezvousMessage =
        bincode::deserialize(packet.payload).map_err(|e| PacketError::Malformed(e.to_string()))?;

    let expected = msg.packet_type();
    if packet.packet_type != expected {
        return Err(PacketError::UnexpectedType {
            got: packet.packet_type,
            expected,
        });
    }

    Ok(msg)
}
