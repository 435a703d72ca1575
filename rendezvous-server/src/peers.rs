//! Registered peers and the address each was last seen from

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Public (NAT-mapped) address the server observed
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

/// Peer table keyed by peer ID
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable::default()
    }

    /// Insert or refresh a peer; returns `true` if it was not known before
    pub fn register(&mut self, peer_id: &str, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                if peer.addr != addr {
                    log::info!("Peer '{}' moved {} -> {}", peer_id, peer.addr, addr);
                    peer.addr = addr;
                }
                peer.last_seen = now;
                false
            }
            None => {
                self.peers.insert(
                    peer_id.to_string(),
                    Peer {
                        addr,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Refresh whichever peer is registered at `addr`
    pub fn touch_addr(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.values_mut().find(|p| p.addr == addr) {
            Some(peer) => {
                peer.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Drop peers not seen for longer than `idle`, returning their IDs
    pub fn expire(&mut self, idle: Duration, now: Instant) -> Vec<String> {
        let expired: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > idle)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([198, 51, 100, 1], port))
    }

    #[test]
    fn test_register_and_refresh() {
        let mut peers = PeerTable::new();
        let t0 = Instant::now();

        assert!(peers.register("alice", addr(1000), t0));
        assert!(!peers.register("alice", addr(2000), t0 + Duration::from_secs(1)));

        let alice = peers.get("alice").unwrap();
        assert_eq!(alice.addr, addr(2000));
        assert_eq!(alice.last_seen, t0 + Duration::from_secs(1));
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn test_touch_by_addr() {
        let mut peers = PeerTable::new();
        let t0 = Instant::now();
        peers.register("alice", addr(1000), t0);

        assert!(peers.touch_addr(addr(1000), t0 + Duration::from_secs(5)));
        assert!(!peers.touch_addr(addr(9999), t0));
        assert_eq!(
            peers.get("alice").unwrap().last_seen,
            t0 + Duration::from_secs(5)
        );
    }

    #[test]
    fn test_expire_idle() {
        let mut peers = PeerTable::new();
        let t0 = Instant::now();
        peers.register("old", addr(1), t0);
        peers.register("new", addr(2), t0 + Duration::from_secs(50));

        let expired = peers.expire(Duration::from_secs(30), t0 + Duration::from_secs(60));

        assert_eq!(expired, vec!["old".to_string()]);
        assert!(peers.get("old").is_none());
        assert!(peers.get("new").is_some());
    }
}
