//! Rendezvous Server
//!
//! A UDP server that:
//! - Registers peers and replies with the public address it observed
//! - Introduces registered peers to each other for hole punching
//! - Tracks connection requests and the outcomes peers report
//! - Optionally serves Prometheus metrics over plain HTTP

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Token};

mod metrics;
mod peers;
mod rendezvous;

use rendezvous::Rendezvous;
use traversal::packet::MAX_PACKET_SIZE;
use traversal::{ConnectionRegistry, TraversalConfig};

// ============================================================================
// Constants
// ============================================================================

/// Default UDP port
const DEFAULT_PORT: u16 = 8081;

/// Peers silent for longer than this are forgotten
const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How often idle peers are expired
const PEER_EXPIRY_INTERVAL: Duration = Duration::from_secs(30);

/// Upper bound on a poll, so shutdown signals are noticed promptly
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// mio token for the UDP socket
const SOCKET_TOKEN: Token = Token(0);

/// mio token for the metrics listener
const METRICS_TOKEN: Token = Token(1);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    let port: u16 = parse_arg(&args, "--port")
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let bind_ip = parse_arg(&args, "--bind").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port: Option<u16> = parse_arg(&args, "--metrics-port").and_then(|s| s.parse().ok());
    let peer_timeout = parse_arg(&args, "--peer-timeout-secs")
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_PEER_TIMEOUT);

    let mut config = match parse_arg(&args, "--config") {
        Some(path) => TraversalConfig::from_file(&path)?,
        None => TraversalConfig::default(),
    };
    config.apply_env();

    let bind_addr: SocketAddr = format!("{}:{}", bind_ip, port).parse()?;
    let metrics_addr = metrics_port
        .map(|p| format!("{}:{}", bind_ip, p).parse::<SocketAddr>())
        .transpose()?;

    log::info!("Rendezvous Server starting...");
    log::info!("  Bind:         {}", bind_addr);
    log::info!("  Peer timeout: {:?}", peer_timeout);
    log::info!("  Registry:     {:?}", config.registry);
    if let Some(addr) = metrics_addr {
        log::info!("  Metrics:      http://{}/metrics", addr);
    }

    let registry = ConnectionRegistry::new(config.registry.clone());
    registry.start_cleanup()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut server = Server::new(bind_addr, metrics_addr, Rendezvous::new(registry, peer_timeout))?;
    server.run(&shutdown)?;

    server.rendezvous.registry().stop_cleanup();
    log::info!("Rendezvous Server stopped");
    Ok(())
}

/// Value following `flag` on the command line
fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Server Structure
// ============================================================================

struct Server {
    /// mio poll instance
    poll: Poll,
    /// UDP socket
    socket: UdpSocket,
    /// Prometheus endpoint, if enabled
    metrics_listener: Option<TcpListener>,
    /// Protocol state
    rendezvous: Rendezvous,
    /// Receive buffer
    recv_buf: Vec<u8>,
}

impl Server {
    fn new(
        bind_addr: SocketAddr,
        metrics_addr: Option<SocketAddr>,
        rendezvous: Rendezvous,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let poll = Poll::new()?;

        let mut socket = UdpSocket::bind(bind_addr)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        log::info!("Server listening on {}", socket.local_addr()?);

        let metrics_listener = match metrics_addr {
            Some(addr) => {
                let mut listener = TcpListener::bind(addr)?;
                poll.registry()
                    .register(&mut listener, METRICS_TOKEN, Interest::READABLE)?;
                log::info!("Metrics listening on {}", listener.local_addr()?);
                Some(listener)
            }
            None => None,
        };

        Ok(Server {
            poll,
            socket,
            metrics_listener,
            rendezvous,
            recv_buf: vec![0u8; MAX_PACKET_SIZE],
        })
    }

    fn run(&mut self, shutdown: &AtomicBool) -> Result<(), Box<dyn std::error::Error>> {
        let mut events = Events::with_capacity(1024);
        let mut next_expiry = Instant::now() + PEER_EXPIRY_INTERVAL;

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    SOCKET_TOKEN => self.process_socket()?,
                    METRICS_TOKEN => self.serve_metrics(),
                    _ => {}
                }
            }

            let now = Instant::now();
            if now >= next_expiry {
                self.rendezvous.expire_peers(now);
                next_expiry = now + PEER_EXPIRY_INTERVAL;
            }
        }

        log::info!("Shutdown requested");
        Ok(())
    }

    fn process_socket(&mut self) -> io::Result<()> {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            let replies = self
                .rendezvous
                .handle_datagram(&self.recv_buf[..len], from, Instant::now());

            for out in replies {
                match self.socket.send_to(&out.data, out.to) {
                    Ok(_) => {}
                    // Reply lost; the peer retries
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        log::debug!("Send to {} would block, dropping", out.to);
                    }
                    Err(e) => log::warn!("Send to {} failed: {}", out.to, e),
                }
            }
        }
        Ok(())
    }

    /// Answer every pending scrape with the current metrics
    fn serve_metrics(&mut self) {
        let Some(listener) = &self.metrics_listener else {
            return;
        };

        loop {
            let (mut stream, from) = match listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("Metrics accept failed: {}", e);
                    break;
                }
            };

            let body = self.rendezvous.metrics().render();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            if let Err(e) = stream.write_all(response.as_bytes()) {
                log::debug!("Metrics write to {} failed: {}", from, e);
            }
        }
    }
}
