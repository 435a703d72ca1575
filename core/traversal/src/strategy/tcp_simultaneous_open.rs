//! TCP simultaneous open
//!
//! Both peers dial each other from the port their NAT mapping was created
//! on. This is the straightforward form: one connect attempt from a socket
//! bound to the local address with address reuse.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socket2::{Domain, Socket, Type};

use super::{Connection, Protocol, StrategyType, TraversalStrategy};
use crate::error::TraversalError;
use crate::nat::NatType;

#[derive(Debug, Clone)]
pub struct TcpSimultaneousOpenStrategy {
    connect_timeout: Duration,
}

impl TcpSimultaneousOpenStrategy {
    pub fn new(connect_timeout: Duration) -> Self {
        TcpSimultaneousOpenStrategy { connect_timeout }
    }

    fn bind_reusable(local_addr: SocketAddr) -> std::io::Result<Socket> {
        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.bind(&local_addr.into())?;
        Ok(socket)
    }
}

impl TraversalStrategy for TcpSimultaneousOpenStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::TcpSimultaneousOpen
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn name(&self) -> &'static str {
        "TCP Simultaneous Open"
    }

    fn estimate_success_rate(&self, local: NatType, remote: NatType) -> f64 {
        use NatType::*;

        match (local, remote) {
            (FullCone, FullCone) => 0.95,
            (FullCone, _) | (_, FullCone) => 0.85,
            (AddressRestrictedCone, AddressRestrictedCone) => 0.70,
            (PortRestrictedCone, _) | (_, PortRestrictedCone) => 0.40,
            (Symmetric, _) | (_, Symmetric) => 0.05,
            _ => 0.35,
        }
    }

    fn establish_connection(
        &self,
        deadline: Instant,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Connection, TraversalError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TraversalError::Timeout);
        }

        let socket = Self::bind_reusable(local_addr)?;
        log::debug!(
            "TCP simultaneous open {} -> {} (timeout {:?})",
            local_addr,
            remote_addr,
            remaining.min(self.connect_timeout)
        );

        socket
            .connect_timeout(&remote_addr.into(), remaining.min(self.connect_timeout))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => TraversalError::Timeout,
                _ => TraversalError::Transport(e),
            })?;

        Ok(Connection::Tcp(socket.into()))
    }
}
