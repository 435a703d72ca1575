//! Error types for the traversal engine

use std::io;

use thiserror::Error;

use crate::packet::{PacketType, MAX_PAYLOAD_SIZE};
use crate::registry::ConnectionStatus;
use crate::strategy::StrategyType;

/// Errors produced by the packet codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Fewer bytes than the 5-byte header
    #[error("packet too small: {0} bytes, header needs 5")]
    Incomplete(usize),
    /// Declared payload length runs past the end of the buffer
    #[error("packet payload incomplete: declared {declared} bytes, {available} available")]
    Truncated { declared: usize, available: usize },
    /// Payload does not fit in a single datagram
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    /// Type byte outside 1..=8
    #[error("unknown packet type: {0}")]
    UnknownType(u8),
    /// Payload could not be decoded into the expected message
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Payload decoded, but it was carried by the wrong packet type
    #[error("unexpected packet type {got:?}, expected {expected:?}")]
    UnexpectedType {
        got: PacketType,
        expected: PacketType,
    },
}

/// Errors from traversal strategies, hole-punch sessions and the engine
#[derive(Debug, Error)]
pub enum TraversalError {
    /// Bind, dial, read or write failure
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// Deadline passed before the connection was established
    #[error("traversal timed out")]
    Timeout,
    /// Data sent before the punch completed
    #[error("session not established")]
    NotEstablished,
    /// Session was closed
    #[error("session closed")]
    SessionClosed,
    /// A session with this ID is already active in the manager
    #[error("session {0} already exists")]
    SessionExists(String),
    /// No strategy registered under this type
    #[error("requested traversal strategy not found: {0}")]
    StrategyNotFound(StrategyType),
    /// The catalog has no strategies at all
    #[error("no valid traversal strategy available")]
    EmptyCatalog,
    /// Relay strategies have no relay server integration
    #[error("{0} relaying not available: no relay server integration")]
    RelayUnavailable(&'static str),
    /// The registry has no request under this connection ID
    #[error("connection {0} not found")]
    ConnectionNotFound(String),
    /// Registry rejected an update made on behalf of a traversal
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
    /// Codec error while building a packet
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),
}

/// Errors from the connection registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An explicit connection ID collided with an existing request
    #[error("connection {0} already registered")]
    DuplicateConnection(String),
    /// Status would move backwards
    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionStatus,
        to: ConnectionStatus,
    },
    /// `start_cleanup` called while the sweep is running
    #[error("cleanup sweep already running")]
    SweeperRunning,
    /// The sweep thread could not be spawned
    #[error("failed to spawn cleanup thread: {0}")]
    Spawn(#[source] io::Error),
    /// The system random source failed
    #[error("failed to generate connection ID")]
    IdGeneration,
}

/// Errors loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors from public address discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("no discovery response after {0} attempts")]
    Timeout(u32),
    #[error("discovery server rejected request: {0}")]
    Rejected(String),
    #[error("invalid discovery server address: {0}")]
    InvalidServer(String),
    #[error("discovery message error: {0}")]
    Message(#[from] PacketError),
}
