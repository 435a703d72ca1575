//! Traversal orchestration
//!
//! Runs one traversal for a registered connection request:
//!
//! ```text
//! negotiating ─► select strategy ─► establish (deadline) ─┬─► established
//!                                                         └─► failed + message
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::TraversalConfig;
use crate::error::TraversalError;
use crate::nat::NatType;
use crate::registry::{ConnectionRegistry, ConnectionStatus};
use crate::strategy::{Connection, Protocol, StrategyCatalog, StrategyType};

/// Metadata key recording the selected strategy
pub const STRATEGY_METADATA_KEY: &str = "strategy";

/// One side's view of a connection to traverse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalRequest {
    /// Registry ID of the connection request
    pub connection_id: String,
    pub local_nat: NatType,
    pub remote_nat: NatType,
    /// Address to establish from
    pub local_addr: SocketAddr,
    /// Peer's public address
    pub remote_addr: SocketAddr,
}

/// A successful traversal
#[derive(Debug)]
pub struct Traversal {
    pub connection_id: String,
    pub strategy: StrategyType,
    pub connection: Connection,
}

/// Selects and runs traversal strategies, recording progress in a registry
#[derive(Debug)]
pub struct TraversalEngine {
    catalog: StrategyCatalog,
    preferred_protocol: Option<Protocol>,
    traversal_timeout: Duration,
}

impl TraversalEngine {
    /// Fails if `catalog` has no strategies
    pub fn new(catalog: StrategyCatalog, config: &TraversalConfig) -> Result<Self, TraversalError> {
        catalog.validate()?;

        Ok(TraversalEngine {
            catalog,
            preferred_protocol: config.preferred_protocol,
            traversal_timeout: config.traversal_timeout,
        })
    }

    pub fn catalog(&self) -> &StrategyCatalog {
        &self.catalog
    }

    /// Run a traversal for `request`, updating its registry entry as it goes
    pub fn traverse(
        &self,
        registry: &ConnectionRegistry,
        request: &TraversalRequest,
    ) -> Result<Traversal, TraversalError> {
        let id = request.connection_id.as_str();

        if !registry.update_connection_status(id, ConnectionStatus::Negotiating)? {
            return Err(TraversalError::ConnectionNotFound(id.to_string()));
        }
        registry.set_addresses(id, Some(request.local_addr), Some(request.remote_addr));

        let strategy = self
            .catalog
            .select_strategy(request.local_nat, request.remote_nat, self.preferred_protocol)
            .ok_or(TraversalError::EmptyCatalog)?;

        registry.set_metadata(
            id,
            STRATEGY_METADATA_KEY,
            serde_json::Value::from(strategy.strategy_type().as_str()),
        );

        log::info!(
            "Connection {}: {} from {} to {} ({} <-> {})",
            id,
            strategy.name(),
            request.local_addr,
            request.remote_addr,
            request.local_nat,
            request.remote_nat
        );

        let deadline = Instant::now() + self.traversal_timeout;
        match strategy.establish_connection(deadline, request.local_addr, request.remote_addr) {
            Ok(connection) => {
                if let Err(e) = registry.update_connection_status(id, ConnectionStatus::Established)
                {
                    connection.close();
                    return Err(e.into());
                }
                log::info!("Connection {}: established via {}", id, strategy.name());

                Ok(Traversal {
                    connection_id: id.to_string(),
                    strategy: strategy.strategy_type(),
                    connection,
                })
            }
            Err(e) => {
                registry.update_connection_error(id, format!("{} failed: {}", strategy.name(), e));
                Err(e)
            }
        }
    }
}
