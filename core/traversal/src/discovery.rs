//! Public address discovery
//!
//! A peer needs the address its NAT maps it to before the other side can
//! punch towards it. [`RendezvousDiscovery`] learns it from the rendezvous
//! server, which replies to `Register` with the source address it observed.
//! Discovery must run on the same socket that will later punch, otherwise
//! the mapping it reports belongs to a different port.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use crate::error::DiscoveryError;
use crate::packet::MAX_PACKET_SIZE;
use crate::signaling::{self, RendezvousMessage};

/// Oracle for this host's public (NAT-mapped) address
pub trait AddressDiscovery {
    fn discover_public_address(
        &self,
        server: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<SocketAddr, DiscoveryError>;
}

/// Resolve `host:port` to the first address it names
pub fn resolve_server(server: &str) -> Result<SocketAddr, DiscoveryError> {
    server
        .to_socket_addrs()
        .map_err(|e| DiscoveryError::InvalidServer(format!("{}: {}", server, e)))?
        .next()
        .ok_or_else(|| DiscoveryError::InvalidServer(server.to_string()))
}

/// Discovery through a rendezvous server registration
///
/// Registering is also what makes the peer known to the server, so a
/// successful discovery leaves the peer registered under `peer_id`.
#[derive(Debug)]
pub struct RendezvousDiscovery<'a> {
    socket: &'a UdpSocket,
    peer_id: String,
}

impl<'a> RendezvousDiscovery<'a> {
    /// `socket` must be in blocking mode
    pub fn new(socket: &'a UdpSocket, peer_id: impl Into<String>) -> Self {
        RendezvousDiscovery {
            socket,
            peer_id: peer_id.into(),
        }
    }

    /// Wait up to `timeout` for our `Registered` from `server`
    fn await_registered(
        &self,
        server: SocketAddr,
        timeout: Duration,
    ) -> Result<Option<SocketAddr>, DiscoveryError> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(left))?;

            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(v) => v,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            };

            if from != server {
                log::debug!("Ignoring {} bytes from {} during discovery", len, from);
                continue;
            }

            match signaling::decode(&buf[..len]) {
                Ok(RendezvousMessage::Registered {
                    peer_id,
                    observed_addr,
                }) if peer_id == self.peer_id => return Ok(Some(observed_addr)),
                Ok(RendezvousMessage::Error { message }) => {
                    return Err(DiscoveryError::Rejected(message))
                }
                Ok(other) => log::debug!("Ignoring {:?} during discovery", other),
                Err(e) => log::debug!("Malformed discovery reply from {}: {}", from, e),
            }
        }
    }
}

impl AddressDiscovery for RendezvousDiscovery<'_> {
    fn discover_public_address(
        &self,
        server: &str,
        timeout: Duration,
        retries: u32,
    ) -> Result<SocketAddr, DiscoveryError> {
        let server_addr = resolve_server(server)?;
        let request = signaling::encode(&RendezvousMessage::Register {
            peer_id: self.peer_id.clone(),
        })?;

        let previous_timeout = self.socket.read_timeout()?;
        let attempts = retries.max(1);
        let mut result = Err(DiscoveryError::Timeout(attempts));

        for attempt in 1..=attempts {
            log::debug!(
                "Discovery attempt {}/{} via {} ({})",
                attempt,
                attempts,
                server,
                server_addr
            );
            self.socket.send_to(&request, server_addr)?;

            match self.await_registered(server_addr, timeout) {
                Ok(Some(observed)) => {
                    log::info!("Public address via {}: {}", server, observed);
                    result = Ok(observed);
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.socket.set_read_timeout(previous_timeout)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Fake server that drops the first `drop_first` registrations, then answers
    fn fake_server(drop_first: usize, reply: fn(String, SocketAddr) -> RendezvousMessage) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();

        thread::spawn(move || {
            let mut buf = vec![0u8; 2048];
            let mut seen = 0;
            loop {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let Ok(RendezvousMessage::Register { peer_id }) = signaling::decode(&buf[..len])
                else {
                    continue;
                };
                seen += 1;
                if seen <= drop_first {
                    continue;
                }
                let out = signaling::encode(&reply(peer_id, from)).unwrap();
                socket.send_to(&out, from).unwrap();
                return;
            }
        });

        addr
    }

    fn registered(peer_id: String, from: SocketAddr) -> RendezvousMessage {
        RendezvousMessage::Registered {
            peer_id,
            observed_addr: from,
        }
    }

    #[test]
    fn test_discovers_observed_address() {
        let server = fake_server(0, registered);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        let discovery = RendezvousDiscovery::new(&socket, "alice");
        let addr = discovery
            .discover_public_address(&server.to_string(), Duration::from_secs(2), 3)
            .unwrap();

        assert_eq!(addr, socket.local_addr().unwrap());
    }

    #[test]
    fn test_retries_after_lost_reply() {
        let server = fake_server(2, registered);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        let discovery = RendezvousDiscovery::new(&socket, "alice");
        let addr = discovery
            .discover_public_address(&server.to_string(), Duration::from_millis(200), 3)
            .unwrap();

        assert_eq!(addr, socket.local_addr().unwrap());
    }

    #[test]
    fn test_times_out_after_retries() {
        let server = fake_server(usize::MAX, registered);
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        let discovery = RendezvousDiscovery::new(&socket, "alice");
        let start = Instant::now();
        let result =
            discovery.discover_public_address(&server.to_string(), Duration::from_millis(100), 2);

        assert!(matches!(result, Err(DiscoveryError::Timeout(2))));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_rejection() {
        let server = fake_server(0, |_, _| RendezvousMessage::Error {
            message: "registry full".into(),
        });
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();

        let discovery = RendezvousDiscovery::new(&socket, "alice");
        let result = discovery.discover_public_address(&server.to_string(), Duration::from_secs(2), 1);

        assert!(matches!(result, Err(DiscoveryError::Rejected(m)) if m == "registry full"));
    }

    #[test]
    fn test_invalid_server() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let discovery = RendezvousDiscovery::new(&socket, "alice");

        let result = discovery.discover_public_address("not an address", Duration::from_millis(10), 1);
        assert!(matches!(result, Err(DiscoveryError::InvalidServer(_))));
    }
}
