//! NAT Traversal Engine
//!
//! Helps two peers behind independent NATs establish a direct connection:
//! - Strategy catalog and selection by NAT pair and protocol preference
//! - UDP hole punching sessions with retry, acknowledgment and rebinding
//! - Connection registry shared with the rendezvous (signaling) server
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          engine.rs                            │
//! │   negotiating ─► select ─► establish ─► established / failed  │
//! ├───────────────────────────┬──────────────────────────────────┤
//! │  strategy/                │  registry.rs                      │
//! │   udp_hole_punch ─────────┼─► hole_punch.rs (sessions)        │
//! │   tcp_simultaneous_open   │                                   │
//! │   relay (udp, tcp)        │                                   │
//! ├───────────────────────────┴──────────────────────────────────┤
//! │  packet.rs (wire codec)   signaling.rs   discovery.rs         │
//! └──────────────────────────────────────────────────────────────┘
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod clock;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod hole_punch;
pub mod id;
pub mod nat;
pub mod packet;
pub mod registry;
pub mod signaling;
pub mod strategy;

// Re-export commonly used types
pub use config::TraversalConfig;
pub use discovery::{AddressDiscovery, RendezvousDiscovery};
pub use engine::{Traversal, TraversalEngine, TraversalRequest};
pub use error::{ConfigError, DiscoveryError, PacketError, RegistryError, TraversalError};
pub use hole_punch::{HolePunchManager, HolePunchSession, SessionState};
pub use nat::NatType;
pub use packet::{Packet, PacketType};
pub use registry::{ConnectionRegistry, ConnectionRequest, ConnectionStatus, NewConnection};
pub use signaling::RendezvousMessage;
pub use strategy::{
    Connection, Protocol, StrategyCatalog, StrategyType, TraversalStrategy,
};
