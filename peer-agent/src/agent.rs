//! Peer agent lifecycle
//!
//! ```text
//! rendezvous socket ── Register ─► Registered (observed addr)
//!                   ── Connect ──► (initiator only)
//!                   ◄─ Introduce ─ peer id, peer addr, connection id
//! drop socket, punch from the same local port
//! engine.traverse ─► Report(established | failed) ─► exchange until shutdown
//! ```

use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use traversal::discovery::resolve_server;
use traversal::packet::{self, PacketType, MAX_PACKET_SIZE};
use traversal::signaling::{self, RendezvousMessage};
use traversal::{
    AddressDiscovery, Connection, ConnectionRegistry, ConnectionStatus, DiscoveryError,
    HolePunchManager, NatType, NewConnection, PacketError, RegistryError, RendezvousDiscovery,
    StrategyCatalog, Traversal, TraversalConfig, TraversalEngine, TraversalError,
    TraversalRequest,
};

/// Read timeout for blocking waits, so shutdown is noticed promptly
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("address discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("rendezvous message error: {0}")]
    Message(#[from] PacketError),

    #[error("rendezvous server refused: {0}")]
    Rejected(String),

    #[error("no introduction within {0:?}")]
    IntroductionTimeout(Duration),

    #[error(transparent)]
    Traversal(#[from] TraversalError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Rendezvous server, `host:port`
    pub server: String,
    pub peer_id: String,
    /// Peer to connect to; without one the agent waits to be introduced
    pub target: Option<String>,
    pub local_nat: NatType,
    pub remote_nat: NatType,
    /// Local address for the rendezvous and punch socket
    pub bind: SocketAddr,
}

/// The rendezvous server's answer to a connect request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Introduction {
    pub connection_id: String,
    pub peer_id: String,
    pub peer_addr: SocketAddr,
    pub initiator: bool,
}

pub struct Agent {
    options: AgentOptions,
    config: TraversalConfig,
    server_addr: SocketAddr,
    registry: ConnectionRegistry,
    engine: TraversalEngine,
    shutdown: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(
        options: AgentOptions,
        config: TraversalConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, AgentError> {
        let server_addr = resolve_server(&options.server)?;
        let manager = HolePunchManager::new(config.hole_punch.clone());
        let engine = TraversalEngine::new(StrategyCatalog::new(&config, manager), &config)?;
        let registry = ConnectionRegistry::new(config.registry.clone());

        Ok(Agent {
            options,
            config,
            server_addr,
            registry,
            engine,
            shutdown,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Rendezvous, traverse, then exchange data until shutdown
    pub fn run(&self) -> Result<(), AgentError> {
        let (local_addr, intro) = self.rendezvous()?;
        let traversal = self.traverse(local_addr, &intro)?;
        self.exchange(traversal)
    }

    /// Register, optionally request a connection, and wait for the introduction
    ///
    /// Returns the local address the rendezvous socket was bound to; the
    /// socket itself is released so the traversal can bind the same port.
    pub fn rendezvous(&self) -> Result<(SocketAddr, Introduction), AgentError> {
        let socket = UdpSocket::bind(self.options.bind)?;
        let local_addr = socket.local_addr()?;

        let observed = RendezvousDiscovery::new(&socket, self.options.peer_id.as_str())
            .discover_public_address(
                &self.options.server,
                self.config.stun.timeout,
                self.config.stun.retries,
            )?;
        log::info!("Registered as '{}': local {} public {}", self.options.peer_id, local_addr, observed);

        if let Some(target) = &self.options.target {
            log::info!("Requesting connection to '{}'", target);
            let connect = signaling::encode(&RendezvousMessage::Connect {
                source_id: self.options.peer_id.clone(),
                target_id: target.clone(),
            })?;
            socket.send_to(&connect, self.server_addr)?;
        } else {
            log::info!("Waiting to be introduced");
        }

        let intro = self.await_introduction(&socket)?;
        log::info!(
            "Introduced to '{}' at {} (connection {}, {})",
            intro.peer_id,
            intro.peer_addr,
            intro.connection_id,
            if intro.initiator { "initiator" } else { "responder" }
        );
        Ok((local_addr, intro))
    }

    fn await_introduction(&self, socket: &UdpSocket) -> Result<Introduction, AgentError> {
        // A responder waits indefinitely; an initiator's request is answered at once
        let deadline = self
            .options
            .target
            .as_ref()
            .map(|_| Instant::now() + self.config.traversal_timeout);
        let keep_alive = packet::serialize(PacketType::KeepAlive, &[])?;
        let mut next_keep_alive = Instant::now() + self.config.hole_punch.keep_alive_interval;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(AgentError::Shutdown);
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return Err(AgentError::IntroductionTimeout(self.config.traversal_timeout));
            }
            if now >= next_keep_alive {
                socket.send_to(&keep_alive, self.server_addr)?;
                next_keep_alive = now + self.config.hole_punch.keep_alive_interval;
            }

            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            if from != self.server_addr {
                log::debug!("Ignoring {} bytes from {} while waiting", len, from);
                continue;
            }

            match signaling::decode(&buf[..len]) {
                Ok(RendezvousMessage::Introduce {
                    connection_id,
                    peer_id,
                    peer_addr,
                    initiator,
                }) => {
                    return Ok(Introduction {
                        connection_id,
                        peer_id,
                        peer_addr,
                        initiator,
                    })
                }
                Ok(RendezvousMessage::Error { message }) => return Err(AgentError::Rejected(message)),
                Ok(other) => log::debug!("Ignoring {:?} while waiting", other),
                Err(e) => log::debug!("Malformed message from server: {}", e),
            }
        }
    }

    /// Run the traversal for `intro` from `local_addr`, reporting the outcome
    pub fn traverse(&self, local_addr: SocketAddr, intro: &Introduction) -> Result<Traversal, AgentError> {
        let (source, target) = if intro.initiator {
            (self.options.peer_id.as_str(), intro.peer_id.as_str())
        } else {
            (intro.peer_id.as_str(), self.options.peer_id.as_str())
        };
        let id = self
            .registry
            .register_connection(NewConnection::new(source, target).with_id(&intro.connection_id))?;

        self.report(&id, ConnectionStatus::Negotiating, None);

        let request = TraversalRequest {
            connection_id: id.clone(),
            local_nat: self.options.local_nat,
            remote_nat: self.options.remote_nat,
            local_addr,
            remote_addr: intro.peer_addr,
        };

        match self.engine.traverse(&self.registry, &request) {
            Ok(traversal) => {
                self.report(&id, ConnectionStatus::Established, None);
                Ok(traversal)
            }
            Err(e) => {
                let error = self
                    .registry
                    .get_connection(&id)
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| e.to_string());
                log::warn!("Connection {}: {}", id, error);
                self.report(&id, ConnectionStatus::Failed, Some(error));
                Err(e.into())
            }
        }
    }

    /// Greet the peer and log whatever arrives until shutdown or close
    pub fn exchange(&self, traversal: Traversal) -> Result<(), AgentError> {
        let greeting = format!("hello from {}", self.options.peer_id);

        let result = match &traversal.connection {
            Connection::Punched(session) => {
                session.send_data(greeting.as_bytes())?;
                while !self.shutdown.load(Ordering::Relaxed) && !session.is_closed() {
                    if let Some(data) = session.recv_data(POLL_INTERVAL) {
                        log_received(&data, session.remote_addr());
                    }
                }
                Ok(())
            }
            Connection::Tcp(stream) => self.exchange_tcp(stream, &greeting),
        };

        traversal.connection.close();
        self.registry
            .update_connection_status(&traversal.connection_id, ConnectionStatus::Closed)?;
        self.report(&traversal.connection_id, ConnectionStatus::Closed, None);
        result
    }

    fn exchange_tcp(&self, stream: &std::net::TcpStream, greeting: &str) -> Result<(), AgentError> {
        let peer = stream.peer_addr()?;
        let mut stream = stream;
        stream.write_all(greeting.as_bytes())?;
        stream.set_read_timeout(Some(POLL_INTERVAL))?;

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        while !self.shutdown.load(Ordering::Relaxed) {
            match stream.read(&mut buf) {
                Ok(0) => {
                    log::info!("Peer {} closed the stream", peer);
                    break;
                }
                Ok(n) => log_received(&buf[..n], peer),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Best-effort status report to the rendezvous server
    ///
    /// Sent from a fresh socket: the rendezvous port belongs to the traversal.
    fn report(&self, connection_id: &str, status: ConnectionStatus, error: Option<String>) {
        let msg = RendezvousMessage::Report {
            connection_id: connection_id.to_string(),
            status,
            error,
        };
        let bind: SocketAddr = if self.server_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let sent = signaling::encode(&msg)
            .map_err(AgentError::from)
            .and_then(|data| {
                let socket = UdpSocket::bind(bind)?;
                socket.send_to(&data, self.server_addr)?;
                Ok(())
            });
        match sent {
            Ok(()) => log::debug!("Reported {} for {}", status, connection_id),
            Err(e) => log::warn!("Failed to report {} for {}: {}", status, connection_id, e),
        }
    }
}

fn log_received(data: &[u8], from: SocketAddr) {
    log::info!(
        "Received {} bytes from {}: {}",
        data.len(),
        from,
        String::from_utf8_lossy(data)
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use traversal::config::HolePunchConfig;
    use traversal::StrategyType;

    fn quick_config() -> TraversalConfig {
        let mut config = TraversalConfig {
            hole_punch: HolePunchConfig {
                retries: 5,
                retry_delay: Duration::from_millis(50),
                timeout: Duration::from_secs(5),
                keep_alive_interval: Duration::from_millis(100),
            },
            traversal_timeout: Duration::from_secs(5),
            ..TraversalConfig::default()
        };
        config.stun.timeout = Duration::from_millis(500);
        config.stun.retries = 3;
        config
    }

    fn options(server: SocketAddr, peer_id: &str, target: Option<&str>) -> AgentOptions {
        AgentOptions {
            server: server.to_string(),
            peer_id: peer_id.to_string(),
            target: target.map(str::to_string),
            local_nat: NatType::AddressRestrictedCone,
            remote_nat: NatType::AddressRestrictedCone,
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    fn agent(server: SocketAddr, peer_id: &str, target: Option<&str>) -> Agent {
        Agent::new(
            options(server, peer_id, target),
            quick_config(),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    /// Fake rendezvous server answering `Register` and replying to `Connect`
    /// with `on_connect`
    fn fake_server(on_connect: fn(SocketAddr) -> RendezvousMessage) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();

        thread::spawn(move || {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            while let Ok((len, from)) = socket.recv_from(&mut buf) {
                let reply = match signaling::decode(&buf[..len]) {
                    Ok(RendezvousMessage::Register { peer_id }) => RendezvousMessage::Registered {
                        peer_id,
                        observed_addr: from,
                    },
                    Ok(RendezvousMessage::Connect { .. }) => on_connect(from),
                    _ => continue,
                };
                let _ = socket.send_to(&signaling::encode(&reply).unwrap(), from);
            }
        });

        addr
    }

    fn introduce(_: SocketAddr) -> RendezvousMessage {
        RendezvousMessage::Introduce {
            connection_id: "c0ffee".into(),
            peer_id: "bob".into(),
            peer_addr: "127.0.0.1:40000".parse().unwrap(),
            initiator: true,
        }
    }

    #[test]
    fn test_rendezvous_returns_introduction() {
        let server = fake_server(introduce);
        let alice = agent(server, "alice", Some("bob"));

        let (local, intro) = alice.rendezvous().unwrap();

        assert_eq!(local.ip(), std::net::Ipv4Addr::LOCALHOST);
        assert_ne!(local.port(), 0);
        assert_eq!(
            intro,
            Introduction {
                connection_id: "c0ffee".into(),
                peer_id: "bob".into(),
                peer_addr: "127.0.0.1:40000".parse().unwrap(),
                initiator: true,
            }
        );

        // The rendezvous socket is released for the traversal
        UdpSocket::bind(local).unwrap();
    }

    #[test]
    fn test_connect_rejected() {
        let server = fake_server(|_| RendezvousMessage::Error {
            message: "peer 'bob' not registered".into(),
        });
        let alice = agent(server, "alice", Some("bob"));

        let result = alice.rendezvous();
        assert!(matches!(result, Err(AgentError::Rejected(m)) if m == "peer 'bob' not registered"));
    }

    #[test]
    fn test_responder_stops_on_shutdown() {
        let server = fake_server(introduce);
        let shutdown = Arc::new(AtomicBool::new(false));
        let bob = Agent::new(options(server, "bob", None), quick_config(), Arc::clone(&shutdown)).unwrap();

        let handle = thread::spawn(move || bob.rendezvous());
        thread::sleep(Duration::from_millis(300));
        shutdown.store(true, Ordering::Relaxed);

        assert!(matches!(handle.join().unwrap(), Err(AgentError::Shutdown)));
    }

    #[test]
    fn test_two_agents_traverse() {
        let server = fake_server(introduce);

        let alice_addr = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let bob_addr = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let run = move |me: &'static str, peer: &'static str, local: SocketAddr, remote: SocketAddr, initiator: bool| {
            thread::spawn(move || {
                let agent = agent(server, me, None);
                let intro = Introduction {
                    connection_id: "conn-7".into(),
                    peer_id: peer.into(),
                    peer_addr: remote,
                    initiator,
                };
                let traversal = agent.traverse(local, &intro).unwrap();
                let request = agent.registry().get_connection("conn-7").unwrap();
                (traversal, request)
            })
        };

        let alice = run("alice", "bob", alice_addr, bob_addr, true);
        let bob = run("bob", "alice", bob_addr, alice_addr, false);
        let (alice, alice_request) = alice.join().unwrap();
        let (bob, bob_request) = bob.join().unwrap();

        assert_eq!(alice.strategy, StrategyType::UdpHolePunching);
        assert_eq!(alice_request.status, ConnectionStatus::Established);
        assert_eq!(alice_request.source_id, "alice");
        assert_eq!(bob_request.source_id, "alice");
        assert_eq!(bob_request.target_id, "bob");

        let (Connection::Punched(a), Connection::Punched(b)) = (&alice.connection, &bob.connection)
        else {
            panic!("expected punched sessions");
        };
        a.send_data(b"hello from alice").unwrap();
        assert_eq!(
            b.recv_data(Duration::from_secs(2)).as_deref(),
            Some(&b"hello from alice"[..])
        );

        alice.connection.close();
        bob.connection.close();
    }

    #[test]
    fn test_failed_traversal_reported() {
        let server = fake_server(introduce);
        let mut config = quick_config();
        config.hole_punch.timeout = Duration::from_millis(400);
        config.traversal_timeout = Duration::from_millis(400);
        let alice = Agent::new(
            options(server, "alice", Some("bob")),
            config,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        // Nobody punches back from this address
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let intro = Introduction {
            connection_id: "conn-9".into(),
            peer_id: "bob".into(),
            peer_addr: silent.local_addr().unwrap(),
            initiator: true,
        };
        let local = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();

        let result = alice.traverse(local, &intro);
        assert!(matches!(result, Err(AgentError::Traversal(TraversalError::Timeout))));

        let request = alice.registry().get_connection("conn-9").unwrap();
        assert_eq!(request.status, ConnectionStatus::Failed);
        assert_eq!(
            request.error.as_deref(),
            Some("UDP Hole Punching failed: traversal timed out")
        );
    }
}
