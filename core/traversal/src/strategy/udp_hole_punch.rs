//! UDP hole punching strategy
//!
//! Binds the requested local address and hands the socket to the shared
//! [`HolePunchManager`], which owns retries and acknowledgment handling.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use super::{Connection, Protocol, StrategyType, TraversalStrategy};
use crate::error::TraversalError;
use crate::hole_punch::HolePunchManager;
use crate::id::generate_connection_id;
use crate::nat::NatType;

#[derive(Debug, Clone)]
pub struct UdpHolePunchStrategy {
    manager: HolePunchManager,
}

impl UdpHolePunchStrategy {
    pub fn new(manager: HolePunchManager) -> Self {
        UdpHolePunchStrategy { manager }
    }
}

impl TraversalStrategy for UdpHolePunchStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::UdpHolePunching
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn name(&self) -> &'static str {
        "UDP Hole Punching"
    }

    fn estimate_success_rate(&self, local: NatType, remote: NatType) -> f64 {
        use NatType::*;

        match (local, remote) {
            (FullCone, _) | (_, FullCone) => 0.95,
            (AddressRestrictedCone, AddressRestrictedCone) => 0.85,
            (PortRestrictedCone, PortRestrictedCone) => 0.60,
            (Symmetric, Symmetric) => 0.10,
            (Symmetric, _) | (_, Symmetric) => 0.30,
            _ => 0.50,
        }
    }

    fn establish_connection(
        &self,
        deadline: Instant,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Connection, TraversalError> {
        // Bind failure is fatal for this strategy
        let socket = UdpSocket::bind(local_addr)?;

        let session_id = generate_connection_id()
            .ok_or_else(|| io::Error::other("failed to generate session ID"))?;

        let session = self
            .manager
            .initiate_hole_punch_on(socket, remote_addr, &session_id)?;

        if session.wait_established(deadline) {
            return Ok(Connection::Punched(session));
        }

        log::info!(
            "Hole punch to {} not established before deadline (session {})",
            remote_addr,
            session_id
        );
        self.manager.close_session(&session_id);
        Err(TraversalError::Timeout)
    }
}
