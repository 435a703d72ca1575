//! Traversal strategies and strategy selection
//!
//! A [`StrategyCatalog`] holds one implementation per [`StrategyType`] in
//! registration order. Selection scores every candidate with its
//! `estimate_success_rate` for the NAT pair and takes the best, with the
//! preferred protocol acting as a soft filter.
//!
//! ```text
//!   select_strategy(local, remote, Some(Tcp))
//!        │
//!        ├─ filter by protocol ── empty? ──► retry with no preference
//!        │
//!        └─ score each, max wins (ties: first registered)
//! ```

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::TraversalConfig;
use crate::error::TraversalError;
use crate::hole_punch::{HolePunchManager, HolePunchSession};
use crate::nat::NatType;

mod relay;
mod tcp_simultaneous_open;
mod udp_hole_punch;

pub use relay::{TcpRelayStrategy, UdpRelayStrategy};
pub use tcp_simultaneous_open::TcpSimultaneousOpenStrategy;
pub use udp_hole_punch::UdpHolePunchStrategy;

// ============================================================================
// Protocol / Strategy Type
// ============================================================================

/// Transport protocol a strategy runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("udp") {
            Ok(Protocol::Udp)
        } else if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else {
            Err(format!("unknown protocol '{}'", s))
        }
    }
}

/// Catalog key, one per strategy implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyType {
    UdpHolePunching,
    TcpSimultaneousOpen,
    UdpRelaying,
    TcpRelaying,
}

impl StrategyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::UdpHolePunching => "udp-hole-punching",
            StrategyType::TcpSimultaneousOpen => "tcp-simultaneous-open",
            StrategyType::UdpRelaying => "udp-relaying",
            StrategyType::TcpRelaying => "tcp-relaying",
        }
    }
}

impl fmt::Display for StrategyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            StrategyType::UdpHolePunching,
            StrategyType::TcpSimultaneousOpen,
            StrategyType::UdpRelaying,
            StrategyType::TcpRelaying,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
        .ok_or_else(|| format!("unknown strategy type '{}'", s))
    }
}

// ============================================================================
// Strategy Trait
// ============================================================================

/// A usable transport produced by a strategy
#[derive(Debug)]
pub enum Connection {
    /// Established UDP hole-punch session
    Punched(Arc<HolePunchSession>),
    /// Connected TCP stream
    Tcp(TcpStream),
}

impl Connection {
    pub fn protocol(&self) -> Protocol {
        match self {
            Connection::Punched(_) => Protocol::Udp,
            Connection::Tcp(_) => Protocol::Tcp,
        }
    }

    /// Tear down the transport
    pub fn close(&self) {
        match self {
            Connection::Punched(session) => session.close(),
            Connection::Tcp(stream) => {
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
        }
    }

    /// Address of the remote end as currently known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Punched(session) => Some(session.remote_addr()),
            Connection::Tcp(stream) => stream.peer_addr().ok(),
        }
    }
}

/// A NAT traversal technique
///
/// Implementations hold only fixed tunables and are shared across callers.
pub trait TraversalStrategy: Send + Sync + fmt::Debug {
    fn strategy_type(&self) -> StrategyType;

    fn protocol(&self) -> Protocol;

    /// Human-readable name
    fn name(&self) -> &'static str;

    /// Estimated chance of success for this NAT pair, always in `[0, 1]`
    fn estimate_success_rate(&self, local: NatType, remote: NatType) -> f64;

    /// Establish a connection from `local_addr` to `remote_addr`
    ///
    /// Must not block past `deadline`.
    fn establish_connection(
        &self,
        deadline: Instant,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Result<Connection, TraversalError>;
}

// ============================================================================
// Catalog / Selector
// ============================================================================

/// Registered strategies in registration order
#[derive(Debug, Default)]
pub struct StrategyCatalog {
    strategies: Vec<Arc<dyn TraversalStrategy>>,
}

impl StrategyCatalog {
    /// Catalog with no strategies
    pub fn empty() -> Self {
        StrategyCatalog::default()
    }

    /// Catalog with all four strategies: hole punch, simultaneous open, UDP relay, TCP relay
    pub fn new(config: &TraversalConfig, manager: HolePunchManager) -> Self {
        let mut catalog = StrategyCatalog::empty();
        catalog.register(Arc::new(UdpHolePunchStrategy::new(manager)));
        catalog.register(Arc::new(TcpSimultaneousOpenStrategy::new(
            config.tcp.connect_timeout,
        )));
        catalog.register(Arc::new(UdpRelayStrategy::new()));
        catalog.register(Arc::new(TcpRelayStrategy::new()));
        catalog
    }

    /// Register a strategy, replacing any existing one of the same type in place
    pub fn register(&mut self, strategy: Arc<dyn TraversalStrategy>) {
        let ty = strategy.strategy_type();
        match self.strategies.iter_mut().find(|s| s.strategy_type() == ty) {
            Some(slot) => *slot = strategy,
            None => self.strategies.push(strategy),
        }
    }

    /// Fail if the catalog is empty (a configuration defect)
    pub fn validate(&self) -> Result<(), TraversalError> {
        if self.strategies.is_empty() {
            return Err(TraversalError::EmptyCatalog);
        }
        Ok(())
    }

    pub fn strategy_by_type(
        &self,
        ty: StrategyType,
    ) -> Result<Arc<dyn TraversalStrategy>, TraversalError> {
        self.strategies
            .iter()
            .find(|s| s.strategy_type() == ty)
            .cloned()
            .ok_or(TraversalError::StrategyNotFound(ty))
    }

    /// All strategies in registration order
    pub fn strategies(&self) -> &[Arc<dyn TraversalStrategy>] {
        &self.strategies
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Score candidates matching `preferred`, best first (stable for ties)
    pub fn rank(
        &self,
        local: NatType,
        remote: NatType,
        preferred: Option<Protocol>,
    ) -> Vec<(Arc<dyn TraversalStrategy>, f64)> {
        let mut ranked: Vec<_> = self
            .strategies
            .iter()
            .filter(|s| preferred.map_or(true, |p| s.protocol() == p))
            .map(|s| (Arc::clone(s), s.estimate_success_rate(local, remote)))
            .collect();

        // sort_by is stable, so equal scores keep registration order
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    /// Pick the strategy with the highest estimated success rate
    ///
    /// `preferred` is a soft filter: if no strategy matches it, selection is
    /// retried across all protocols. Returns `None` only for an empty catalog.
    pub fn select_strategy(
        &self,
        local: NatType,
        remote: NatType,
        preferred: Option<Protocol>,
    ) -> Option<Arc<dyn TraversalStrategy>> {
        if let Some((best, rate)) = self.rank(local, remote, preferred).into_iter().next() {
            log::debug!(
                "Selected {} ({:.2}) for {} <-> {} (preferred: {:?})",
                best.name(),
                rate,
                local,
                remote,
                preferred
            );
            return Some(best);
        }

        if preferred.is_some() {
            log::debug!(
                "No {:?} strategy registered, selecting across all protocols",
                preferred
            );
            return self.select_strategy(local, remote, None);
        }

        None
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> StrategyCatalog {
        let config = TraversalConfig::default();
        StrategyCatalog::new(&config, HolePunchManager::new(config.hole_punch.clone()))
    }

    /// Strategy with a fixed score, for tie-breaking tests
    #[derive(Debug)]
    struct Fixed(StrategyType, Protocol, f64);

    impl TraversalStrategy for Fixed {
        fn strategy_type(&self) -> StrategyType {
            self.0
        }
        fn protocol(&self) -> Protocol {
            self.1
        }
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn estimate_success_rate(&self, _: NatType, _: NatType) -> f64 {
            self.2
        }
        fn establish_connection(
            &self,
            _: Instant,
            _: SocketAddr,
            _: SocketAddr,
        ) -> Result<Connection, TraversalError> {
            Err(TraversalError::Timeout)
        }
    }

    #[test]
    fn test_all_rates_in_unit_interval() {
        let catalog = catalog();
        for strategy in catalog.strategies() {
            for local in NatType::ALL {
                for remote in NatType::ALL {
                    let rate = strategy.estimate_success_rate(local, remote);
                    assert!(
                        (0.0..=1.0).contains(&rate),
                        "{} gave {} for {}/{}",
                        strategy.name(),
                        rate,
                        local,
                        remote
                    );
                }
            }
        }
    }

    #[test]
    fn test_registration_order() {
        let types: Vec<_> = catalog()
            .strategies()
            .iter()
            .map(|s| s.strategy_type())
            .collect();
        assert_eq!(
            types,
            vec![
                StrategyType::UdpHolePunching,
                StrategyType::TcpSimultaneousOpen,
                StrategyType::UdpRelaying,
                StrategyType::TcpRelaying,
            ]
        );
    }

    #[test]
    fn test_full_cone_selects_hole_punch() {
        let selected = catalog()
            .select_strategy(NatType::FullCone, NatType::FullCone, None)
            .unwrap();
        assert_eq!(selected.strategy_type(), StrategyType::UdpHolePunching);
    }

    #[test]
    fn test_symmetric_selects_relay() {
        let selected = catalog()
            .select_strategy(NatType::Symmetric, NatType::Symmetric, None)
            .unwrap();
        assert_eq!(selected.strategy_type(), StrategyType::UdpRelaying);
    }

    #[test]
    fn test_one_symmetric_selects_relay() {
        let selected = catalog()
            .select_strategy(NatType::Symmetric, NatType::PortRestrictedCone, None)
            .unwrap();
        assert_eq!(selected.strategy_type(), StrategyType::UdpRelaying);
    }

    #[test]
    fn test_tcp_preference_honoured() {
        let selected = catalog()
            .select_strategy(NatType::FullCone, NatType::FullCone, Some(Protocol::Tcp))
            .unwrap();
        assert_eq!(selected.protocol(), Protocol::Tcp);
        assert_eq!(selected.strategy_type(), StrategyType::TcpSimultaneousOpen);
    }

    #[test]
    fn test_tcp_preference_under_symmetric_picks_tcp_relay() {
        let selected = catalog()
            .select_strategy(NatType::Symmetric, NatType::Symmetric, Some(Protocol::Tcp))
            .unwrap();
        assert_eq!(selected.strategy_type(), StrategyType::TcpRelaying);
    }

    #[test]
    fn test_unmatched_preference_falls_back() {
        let mut catalog = StrategyCatalog::empty();
        catalog.register(Arc::new(Fixed(
            StrategyType::UdpHolePunching,
            Protocol::Udp,
            0.4,
        )));

        let selected = catalog
            .select_strategy(NatType::Unknown, NatType::Unknown, Some(Protocol::Tcp))
            .unwrap();
        assert_eq!(selected.strategy_type(), StrategyType::UdpHolePunching);
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let mut catalog = StrategyCatalog::empty();
        catalog.register(Arc::new(Fixed(StrategyType::UdpRelaying, Protocol::Udp, 0.5)));
        catalog.register(Arc::new(Fixed(
            StrategyType::UdpHolePunching,
            Protocol::Udp,
            0.5,
        )));

        let selected = catalog
            .select_strategy(NatType::Unknown, NatType::Unknown, None)
            .unwrap();
        assert_eq!(selected.strategy_type(), StrategyType::UdpRelaying);
    }

    #[test]
    fn test_empty_catalog() {
        let catalog = StrategyCatalog::empty();
        assert!(catalog
            .select_strategy(NatType::FullCone, NatType::FullCone, Some(Protocol::Udp))
            .is_none());
        assert!(matches!(catalog.validate(), Err(TraversalError::EmptyCatalog)));
    }

    #[test]
    fn test_register_replaces_same_type() {
        let mut catalog = catalog();
        catalog.register(Arc::new(Fixed(StrategyType::TcpRelaying, Protocol::Tcp, 1.0)));

        assert_eq!(catalog.len(), 4);
        let selected = catalog
            .select_strategy(NatType::FullCone, NatType::FullCone, None)
            .unwrap();
        assert_eq!(selected.strategy_type(), StrategyType::TcpRelaying);
        assert_eq!(selected.name(), "fixed");
    }

    #[test]
    fn test_strategy_by_type() {
        let catalog = StrategyCatalog::empty();
        assert!(matches!(
            catalog.strategy_by_type(StrategyType::TcpRelaying),
            Err(TraversalError::StrategyNotFound(StrategyType::TcpRelaying))
        ));

        let catalog = super::tests::catalog();
        let relay = catalog.strategy_by_type(StrategyType::TcpRelaying).unwrap();
        assert_eq!(relay.name(), "TCP Relaying");
    }

    #[test]
    fn test_rank_orders_best_first() {
        let ranked = catalog().rank(NatType::PortRestrictedCone, NatType::PortRestrictedCone, None);
        let rates: Vec<f64> = ranked.iter().map(|(_, r)| *r).collect();
        assert_eq!(rates, vec![0.70, 0.65, 0.60, 0.40]);
    }

    #[test]
    fn test_strategy_type_parse() {
        assert_eq!(
            "tcp-simultaneous-open".parse::<StrategyType>().unwrap(),
            StrategyType::TcpSimultaneousOpen
        );
        assert!("carrier-pigeon".parse::<StrategyType>().is_err());
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
    }
}
