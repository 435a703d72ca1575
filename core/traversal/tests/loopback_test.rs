//! Loopback integration tests
//!
//! Two peers on 127.0.0.1 stand in for two hosts behind NATs; the punch
//! protocol is the same whether or not a NAT sits in between.

use std::net::{SocketAddr, UdpSocket};
use std::thread;
use std::time::{Duration, Instant};

use traversal::config::{HolePunchConfig, RegistryConfig};
use traversal::{
    Connection, ConnectionRegistry, ConnectionStatus, HolePunchManager, NatType, NewConnection,
    StrategyCatalog, StrategyType, TraversalConfig, TraversalEngine, TraversalError,
    TraversalRequest,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_hole_punch() -> HolePunchConfig {
    HolePunchConfig {
        retries: 5,
        retry_delay: Duration::from_millis(50),
        timeout: Duration::from_secs(5),
        keep_alive_interval: Duration::from_millis(100),
    }
}

/// Reserve a loopback port by binding and releasing it
fn free_udp_addr() -> SocketAddr {
    UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

#[test]
fn test_two_managers_punch_and_exchange_data() {
    init_logging();

    let alice_mgr = HolePunchManager::new(fast_hole_punch());
    let bob_mgr = HolePunchManager::new(fast_hole_punch());

    let alice_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let bob_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let alice_addr = alice_socket.local_addr().unwrap();
    let bob_addr = bob_socket.local_addr().unwrap();

    let alice = alice_mgr
        .initiate_hole_punch_on(alice_socket, bob_addr, "alice-session")
        .unwrap();
    let bob = bob_mgr
        .initiate_hole_punch_on(bob_socket, alice_addr, "bob-session")
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    assert!(alice.wait_established(deadline));
    assert!(bob.wait_established(deadline));
    assert_eq!(alice.remote_addr(), bob_addr);
    assert_eq!(bob.remote_addr(), alice_addr);

    alice.send_data(b"hello bob").unwrap();
    bob.send_data(b"hello alice").unwrap();

    assert_eq!(
        bob.recv_data(Duration::from_secs(2)),
        Some(b"hello bob".to_vec())
    );
    assert_eq!(
        alice.recv_data(Duration::from_secs(2)),
        Some(b"hello alice".to_vec())
    );

    // Keep-alives flow without disturbing the established state
    let before = bob.last_activity();
    thread::sleep(Duration::from_millis(300));
    assert!(bob.is_established());
    assert!(bob.last_activity() > before);

    alice_mgr.close_all();
    bob_mgr.close_all();
    assert!(alice.is_closed());
    assert!(matches!(
        alice.send_data(b"bye"),
        Err(TraversalError::SessionClosed)
    ));
}

#[test]
fn test_engines_traverse_over_loopback() {
    init_logging();

    let config = TraversalConfig {
        hole_punch: fast_hole_punch(),
        traversal_timeout: Duration::from_secs(5),
        ..TraversalConfig::default()
    };

    let alice_addr = free_udp_addr();
    let bob_addr = free_udp_addr();

    let run = move |local: SocketAddr, remote: SocketAddr, id: &'static str| {
        let config = config.clone();
        thread::spawn(move || {
            let manager = HolePunchManager::new(config.hole_punch.clone());
            let engine =
                TraversalEngine::new(StrategyCatalog::new(&config, manager), &config).unwrap();
            let registry = ConnectionRegistry::new(RegistryConfig::default());
            registry
                .register_connection(NewConnection::new("alice", "bob").with_id(id))
                .unwrap();

            let traversal = engine
                .traverse(
                    &registry,
                    &TraversalRequest {
                        connection_id: id.to_string(),
                        local_nat: NatType::AddressRestrictedCone,
                        remote_nat: NatType::AddressRestrictedCone,
                        local_addr: local,
                        remote_addr: remote,
                    },
                )
                .unwrap();

            let status = registry.get_connection(id).unwrap().status;
            (traversal, status)
        })
    };

    let alice = run(alice_addr, bob_addr, "conn-1");
    let bob = run(bob_addr, alice_addr, "conn-1");

    let (alice, alice_status) = alice.join().unwrap();
    let (bob, bob_status) = bob.join().unwrap();

    assert_eq!(alice.strategy, StrategyType::UdpHolePunching);
    assert_eq!(alice_status, ConnectionStatus::Established);
    assert_eq!(bob_status, ConnectionStatus::Established);

    match (&alice.connection, &bob.connection) {
        (Connection::Punched(a), Connection::Punched(b)) => {
            a.send_data(b"ping").unwrap();
            assert_eq!(b.recv_data(Duration::from_secs(2)), Some(b"ping".to_vec()));
        }
        other => panic!("Expected punched sessions, got {:?}", other),
    }

    alice.connection.close();
    bob.connection.close();
}

#[test]
fn test_unanswered_traversal_marks_failed() {
    init_logging();

    let config = TraversalConfig {
        hole_punch: HolePunchConfig {
            retries: 2,
            retry_delay: Duration::from_millis(20),
            ..HolePunchConfig::default()
        },
        traversal_timeout: Duration::from_millis(300),
        ..TraversalConfig::default()
    };
    let manager = HolePunchManager::new(config.hole_punch.clone());
    let engine = TraversalEngine::new(StrategyCatalog::new(&config, manager.clone()), &config)
        .unwrap();
    let registry = ConnectionRegistry::new(RegistryConfig::default());
    let id = registry
        .register_connection(NewConnection::new("alice", "nobody"))
        .unwrap();

    // Bound but silent, so punches are neither answered nor refused
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();

    let start = Instant::now();
    let result = engine.traverse(
        &registry,
        &TraversalRequest {
            connection_id: id.clone(),
            local_nat: NatType::FullCone,
            remote_nat: NatType::FullCone,
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote_addr: silent.local_addr().unwrap(),
        },
    );

    assert!(matches!(result, Err(TraversalError::Timeout)));
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(manager.is_empty());

    let stored = registry.get_connection(&id).unwrap();
    assert_eq!(stored.status, ConnectionStatus::Failed);
    assert_eq!(
        stored.error.as_deref(),
        Some("UDP Hole Punching failed: traversal timed out")
    );
}
