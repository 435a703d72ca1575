//! TURN-style relay strategies
//!
//! Relays score high only when a symmetric NAT is involved, so direct
//! strategies win otherwise. There is no relay server integration yet:
//! establishing always fails with `RelayUnavailable`.

use std::net::SocketAddr;
use std::time::Instant;

use super::{Connection, Protocol, StrategyType, TraversalStrategy};
use crate::error::TraversalError;
use crate::nat::NatType;

/// Success rates for (both symmetric, one symmetric, neither)
fn relay_rate(local: NatType, remote: NatType, rates: (f64, f64, f64)) -> f64 {
    match (local == NatType::Symmetric, remote == NatType::Symmetric) {
        (true, true) => rates.0,
        (true, false) | (false, true) => rates.1,
        (false, false) => rates.2,
    }
}

#[derive(Debug, Clone, Default)]
pub struct UdpRelayStrategy;

impl UdpRelayStrategy {
    pub fn new() -> Self {
        UdpRelayStrategy
    }
}

impl TraversalStrategy for UdpRelayStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::UdpRelaying
    }

    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn name(&self) -> &'static str {
        "UDP Relaying"
    }

    fn estimate_success_rate(&self, local: NatType, remote: NatType) -> f64 {
        relay_rate(local, remote, (0.95, 0.80, 0.70))
    }

    fn establish_connection(
        &self,
        _deadline: Instant,
        _local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Connection, TraversalError> {
        log::warn!("UDP relay to {} requested but no relay server is integrated", remote_addr);
        Err(TraversalError::RelayUnavailable("UDP"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TcpRelayStrategy;

impl TcpRelayStrategy {
    pub fn new() -> Self {
        TcpRelayStrategy
    }
}

impl TraversalStrategy for TcpRelayStrategy {
    fn strategy_type(&self) -> StrategyType {
        StrategyType::TcpRelaying
    }

    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn name(&self) -> &'static str {
        "TCP Relaying"
    }

    fn estimate_success_rate(&self, local: NatType, remote: NatType) -> f64 {
        relay_rate(local, remote, (0.92, 0.75, 0.65))
    }

    fn establish_connection(
        &self,
        _deadline: Instant,
        _local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Connection, TraversalError> {
        log::warn!("TCP relay to {} requested but no relay server is integrated", remote_addr);
        Err(TraversalError::RelayUnavailable("TCP"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use NatType::*;

    #[test]
    fn test_udp_relay_rates() {
        let s = UdpRelayStrategy::new();
        assert_eq!(s.estimate_success_rate(Symmetric, Symmetric), 0.95);
        assert_eq!(s.estimate_success_rate(Symmetric, FullCone), 0.80);
        assert_eq!(s.estimate_success_rate(Unknown, Symmetric), 0.80);
        assert_eq!(s.estimate_success_rate(FullCone, FullCone), 0.70);
    }

    #[test]
    fn test_tcp_relay_rates() {
        let s = TcpRelayStrategy::new();
        assert_eq!(s.estimate_success_rate(Symmetric, Symmetric), 0.92);
        assert_eq!(s.estimate_success_rate(PortRestrictedCone, Symmetric), 0.75);
        assert_eq!(s.estimate_success_rate(AddressRestrictedCone, Unknown), 0.65);
    }

    #[test]
    fn test_relays_lose_to_direct_without_symmetric() {
        let relay = UdpRelayStrategy::new();
        assert!(relay.estimate_success_rate(FullCone, PortRestrictedCone) < 0.95);
        assert!(relay.estimate_success_rate(AddressRestrictedCone, AddressRestrictedCone) < 0.85);
    }

    #[test]
    fn test_establish_unavailable() {
        let result = TcpRelayStrategy::new().establish_connection(
            Instant::now(),
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:9".parse().unwrap(),
        );
        assert!(matches!(result, Err(TraversalError::RelayUnavailable("TCP"))));
    }
}
