//! Peer Agent
//!
//! A UDP/TCP peer that:
//! - Registers with a rendezvous server and learns its public address
//! - Requests an introduction to a target peer, or waits to be introduced
//! - Selects and runs a NAT traversal strategy towards the peer
//! - Reports the outcome and exchanges data until shutdown

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use traversal::id::generate_peer_id;
use traversal::{NatType, Protocol, TraversalConfig};

mod agent;

use agent::{Agent, AgentError, AgentOptions};

// ============================================================================
// Constants
// ============================================================================

/// Default rendezvous server
const DEFAULT_SERVER: &str = "127.0.0.1:8081";

/// Default local bind address (any interface, ephemeral port)
const DEFAULT_BIND: &str = "0.0.0.0:0";

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --server <host:port>   Rendezvous server
    // --peer-id <id>         Our peer ID (random if omitted)
    // --target <id>          Peer to connect to (wait for introductions if omitted)
    // --local-nat <type>     Our NAT type (full-cone, ..., symmetric, unknown)
    // --remote-nat <type>    Peer's NAT type
    // --protocol <udp|tcp>   Preferred transport
    // --bind <addr:port>     Local address
    // --config <path>        JSON configuration

    let server = parse_arg(&args, "--server").unwrap_or_else(|| DEFAULT_SERVER.to_string());
    let peer_id = match parse_arg(&args, "--peer-id") {
        Some(id) => id,
        None => generate_peer_id().ok_or("Failed to generate peer ID")?,
    };
    let target = parse_arg(&args, "--target");
    let local_nat: NatType = parse_arg(&args, "--local-nat")
        .map(|s| s.parse::<NatType>())
        .transpose()?
        .unwrap_or_default();
    let remote_nat: NatType = parse_arg(&args, "--remote-nat")
        .map(|s| s.parse::<NatType>())
        .transpose()?
        .unwrap_or_default();
    let bind: SocketAddr = parse_arg(&args, "--bind")
        .unwrap_or_else(|| DEFAULT_BIND.to_string())
        .parse()
        .map_err(|_| "Invalid bind address")?;

    let mut config = match parse_arg(&args, "--config") {
        Some(path) => TraversalConfig::from_file(&path)?,
        None => TraversalConfig::default(),
    };
    config.apply_env();
    if let Some(protocol) = parse_arg(&args, "--protocol") {
        config.preferred_protocol = Some(protocol.parse::<Protocol>()?);
    }

    log::info!("Peer Agent starting...");
    log::info!("  Server:   {}", server);
    log::info!("  Peer ID:  {}", peer_id);
    log::info!("  Target:   {}", target.as_deref().unwrap_or("(wait for introduction)"));
    log::info!("  NAT:      {} <-> {}", local_nat, remote_nat);
    log::info!(
        "  Protocol: {}",
        config
            .preferred_protocol
            .map_or_else(|| "any".to_string(), |p| p.to_string())
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let options = AgentOptions {
        server,
        peer_id,
        target,
        local_nat,
        remote_nat,
        bind,
    };
    let agent = Agent::new(options, config, shutdown)?;

    match agent.run() {
        Ok(()) | Err(AgentError::Shutdown) => {
            log::info!("Peer Agent stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
