//! Rendezvous protocol handling
//!
//! Pure message handling, independent of the socket: each datagram in
//! produces zero or more datagrams out.
//!
//! ```text
//! Register(id)        → Registered(id, observed addr)         to sender
//! Connect(src, dst)   → Introduce(dst, addr dst, initiator)   to src
//!                       Introduce(src, addr src, !initiator)  to dst
//!                       or Error(..)                          to sender
//! Report(conn, st)    → registry update, sender host must be a party
//! keep-alive          → refresh the peer registered at sender
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use traversal::packet::{self, PacketType};
use traversal::registry::NewConnection;
use traversal::signaling::{self, RendezvousMessage};
use traversal::{ConnectionRegistry, ConnectionStatus, RegistryError};

use crate::metrics::Metrics;
use crate::peers::PeerTable;

/// A datagram to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

pub struct Rendezvous {
    peers: PeerTable,
    registry: ConnectionRegistry,
    metrics: Metrics,
    peer_timeout: Duration,
}

impl Rendezvous {
    pub fn new(registry: ConnectionRegistry, peer_timeout: Duration) -> Self {
        Rendezvous {
            peers: PeerTable::new(),
            registry,
            metrics: Metrics::new(),
            peer_timeout,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Handle one received datagram
    pub fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) -> Vec<Outgoing> {
        match packet::parse(datagram) {
            Ok(p) if p.packet_type == PacketType::KeepAlive => {
                if !self.peers.touch_addr(from, now) {
                    log::trace!("Keep-alive from unregistered {}", from);
                }
                return Vec::new();
            }
            Ok(_) => {}
            Err(e) => {
                Metrics::inc(&self.metrics.malformed_packets_total);
                log::debug!("Dropping malformed packet from {}: {}", from, e);
                return Vec::new();
            }
        }

        let msg = match signaling::decode(datagram) {
            Ok(msg) => msg,
            Err(e) => {
                Metrics::inc(&self.metrics.malformed_packets_total);
                log::debug!("Dropping undecodable message from {}: {}", from, e);
                return Vec::new();
            }
        };

        log::trace!("Received {:?} from {}", msg, from);

        match msg {
            RendezvousMessage::Register { peer_id } => self.handle_register(peer_id, from, now),
            RendezvousMessage::Connect {
                source_id,
                target_id,
            } => self.handle_connect(&source_id, &target_id, from, now),
            RendezvousMessage::Report {
                connection_id,
                status,
                error,
            } => self.handle_report(&connection_id, status, error, from),
            other => {
                log::debug!("Ignoring server-bound {:?} from {}", other, from);
                Vec::new()
            }
        }
    }

    fn handle_register(&mut self, peer_id: String, from: SocketAddr, now: Instant) -> Vec<Outgoing> {
        if peer_id.is_empty() {
            return error_to(from, "peer ID must not be empty");
        }

        if self.peers.register(&peer_id, from, now) {
            log::info!("Peer '{}' registered from {}", peer_id, from);
        }
        Metrics::inc(&self.metrics.registrations_total);
        self.update_peer_gauge();

        reply(
            from,
            &RendezvousMessage::Registered {
                peer_id,
                observed_addr: from,
            },
        )
    }

    fn handle_connect(
        &mut self,
        source_id: &str,
        target_id: &str,
        from: SocketAddr,
        now: Instant,
    ) -> Vec<Outgoing> {
        if source_id == target_id {
            Metrics::inc(&self.metrics.introduction_failures_total);
            return error_to(from, "cannot connect a peer to itself");
        }

        if self.peers.get(source_id).is_none() {
            Metrics::inc(&self.metrics.introduction_failures_total);
            return error_to(from, &format!("peer '{}' not registered", source_id));
        }
        // The connect request is the freshest sighting of the source's mapping
        self.peers.register(source_id, from, now);

        let Some(target_addr) = self.peers.get(target_id).map(|p| p.addr) else {
            Metrics::inc(&self.metrics.introduction_failures_total);
            log::info!("Connect {} -> {}: target not registered", source_id, target_id);
            return error_to(from, &format!("peer '{}' not registered", target_id));
        };

        let connection_id = match self
            .registry
            .register_connection(NewConnection::new(source_id, target_id))
        {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to register connection {} -> {}: {}", source_id, target_id, e);
                return error_to(from, "internal error");
            }
        };
        self.registry
            .set_addresses(&connection_id, Some(from), Some(target_addr));

        log::info!(
            "Introducing {} ({}) <-> {} ({}) as {}",
            source_id,
            from,
            target_id,
            target_addr,
            connection_id
        );
        Metrics::inc(&self.metrics.introductions_total);

        let mut out = reply(
            from,
            &RendezvousMessage::Introduce {
                connection_id: connection_id.clone(),
                peer_id: target_id.to_string(),
                peer_addr: target_addr,
                initiator: true,
            },
        );
        out.extend(reply(
            target_addr,
            &RendezvousMessage::Introduce {
                connection_id,
                peer_id: source_id.to_string(),
                peer_addr: from,
                initiator: false,
            },
        ));
        out
    }

    fn handle_report(
        &mut self,
        connection_id: &str,
        status: ConnectionStatus,
        error: Option<String>,
        from: SocketAddr,
    ) -> Vec<Outgoing> {
        let Some(request) = self.registry.get_connection(connection_id) else {
            return error_to(from, &format!("connection {} not found", connection_id));
        };

        // Reports arrive from a fresh port once the punch socket holds the
        // registered one, so only the host is matched
        let party = [&request.source_id, &request.target_id]
            .into_iter()
            .any(|id| self.peers.get(id).is_some_and(|p| p.addr.ip() == from.ip()));
        if !party {
            log::warn!("Report for {} from non-party {}", connection_id, from);
            return error_to(from, &format!("not a party to connection {}", connection_id));
        }

        if status == ConnectionStatus::Failed {
            let message = error.unwrap_or_else(|| "traversal failed".to_string());
            self.registry.update_connection_error(connection_id, message);
            Metrics::inc(&self.metrics.traversals_failed_total);
            return Vec::new();
        }

        match self.registry.update_connection_status(connection_id, status) {
            Ok(true) => {
                log::info!("Connection {} reported {} by {}", connection_id, status, from);
                if status == ConnectionStatus::Established
                    && request.status != ConnectionStatus::Established
                {
                    Metrics::inc(&self.metrics.traversals_established_total);
                }
            }
            Ok(false) => {}
            Err(RegistryError::InvalidTransition { from: old, to }) => {
                log::debug!(
                    "Ignoring report {} -> {} for {} from {}",
                    old,
                    to,
                    connection_id,
                    from
                );
            }
            Err(e) => log::warn!("Report for {} rejected: {}", connection_id, e),
        }
        Vec::new()
    }

    /// Forget peers idle longer than the peer timeout
    pub fn expire_peers(&mut self, now: Instant) -> usize {
        let expired = self.peers.expire(self.peer_timeout, now);
        for id in &expired {
            log::info!("Peer '{}' expired", id);
        }
        self.update_peer_gauge();
        expired.len()
    }

    fn update_peer_gauge(&self) {
        self.metrics
            .active_peers
            .store(self.peers.len() as u64, std::sync::atomic::Ordering::Relaxed);
    }
}

fn reply(to: SocketAddr, msg: &RendezvousMessage) -> Vec<Outgoing> {
    match signaling::encode(msg) {
        Ok(data) => vec![Outgoing { to, data }],
        Err(e) => {
            log::error!("Failed to encode {:?}: {}", msg, e);
            Vec::new()
        }
    }
}

fn error_to(to: SocketAddr, message: &str) -> Vec<Outgoing> {
    reply(
        to,
        &RendezvousMessage::Error {
            message: message.to_string(),
        },
    )
}

// ============================================================================
// Tests
// ============================================================================
