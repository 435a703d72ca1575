//! UDP hole-punch sessions
//!
//! Each session owns one UDP socket and two worker threads:
//!
//! ```text
//!            ┌────────────── punch thread ──────────────┐
//!            │ hole-punch x retries (retry_delay apart) │
//!            │ wait for established until timeout       │
//!            │ then keep-alive every keep_alive_interval│
//!            └──────────────────────────────────────────┘
//!  socket ──►┌────────────── listen thread ─────────────┐
//!            │ mio::Poll { socket, waker }              │
//!            │ hole-punch     → ack to source, provisional
//!            │ hole-punch-ack → established             │
//!            │ keep-alive     → refresh activity        │
//!            │ data           → session inbox           │
//!            └──────────────────────────────────────────┘
//! ```
//!
//! Only a hole-punch or its ack may move the session to a new source
//! address, and only once. Every other packet must come from the current
//! remote address.
//!
//! Session state lives behind a mutex with a condition variable, so closing
//! or establishing a session wakes every waiter immediately. Closing drops
//! the socket before anyone can observe the closed state, then fires the
//! `mio::Waker` that unblocks the listen thread.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::thread;
use std::time::{Duration, Instant};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::HolePunchConfig;
use crate::error::TraversalError;
use crate::packet::{self, PacketType, MAX_PACKET_SIZE};

// ============================================================================
// Constants
// ============================================================================

/// mio token for the session socket
const SOCKET_TOKEN: Token = Token(0);

/// mio token for the close waker
const WAKER_TOKEN: Token = Token(1);

/// Undelivered data packets kept per session; oldest are dropped first
const INBOX_CAPACITY: usize = 1024;

// ============================================================================
// Session State
// ============================================================================

/// Hole-punch progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Punches sent, nothing heard yet
    Probing,
    /// Peer's punch arrived; our ack is on its way
    Provisional,
    /// Peer acknowledged our punch
    Established,
    Closed,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    remote_addr: SocketAddr,
    rebound: bool,
    last_activity: Instant,
    inbox: VecDeque<Vec<u8>>,
}

/// One hole-punch attempt and, once established, the punched path
pub struct HolePunchSession {
    id: String,
    local_addr: SocketAddr,
    /// `None` once closed
    socket: Mutex<Option<UdpSocket>>,
    started: Instant,
    inner: Mutex<SessionInner>,
    changed: Condvar,
    waker: Waker,
    manager: Weak<ManagerInner>,
}

impl fmt::Debug for HolePunchSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("HolePunchSession")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &inner.remote_addr)
            .field("state", &inner.state)
            .finish()
    }
}

impl HolePunchSession {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn socket(&self) -> MutexGuard<'_, Option<UdpSocket>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_raw(&self, datagram: &[u8], to: SocketAddr) -> Result<(), TraversalError> {
        match self.socket().as_ref() {
            Some(socket) => {
                socket.send_to(datagram, to)?;
                Ok(())
            }
            None => Err(TraversalError::SessionClosed),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current remote address (may have been rebound to the peer's actual source)
    pub fn remote_addr(&self) -> SocketAddr {
        self.lock().remote_addr
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }

    /// Block until the session is established, closed, or `deadline` passes
    ///
    /// Returns `true` only if the session is established.
    pub fn wait_established(&self, deadline: Instant) -> bool {
        let state = self.wait_until(deadline, |inner| {
            matches!(
                inner.state,
                SessionState::Established | SessionState::Closed
            )
        });
        state == SessionState::Established
    }

    /// Send application data over the punched path
    pub fn send_data(&self, data: &[u8]) -> Result<(), TraversalError> {
        let remote = {
            let inner = self.lock();
            match inner.state {
                SessionState::Closed => return Err(TraversalError::SessionClosed),
                SessionState::Established => inner.remote_addr,
                _ => return Err(TraversalError::NotEstablished),
            }
        };

        let encoded = packet::serialize(PacketType::Data, data)?;
        self.send_raw(&encoded, remote)?;
        self.touch();
        Ok(())
    }

    pub fn send_keep_alive(&self) -> Result<(), TraversalError> {
        let remote = {
            let inner = self.lock();
            if inner.state == SessionState::Closed {
                return Err(TraversalError::SessionClosed);
            }
            inner.remote_addr
        };

        let encoded = packet::serialize(PacketType::KeepAlive, &[])?;
        self.send_raw(&encoded, remote)
    }

    /// Take the next received data payload, waiting up to `timeout`
    ///
    /// Returns `None` on timeout, or once closed and drained.
    pub fn recv_data(&self, timeout: Duration) -> Option<Vec<u8>> {
        let guard = self.lock();
        let (mut inner, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |inner| {
                inner.inbox.is_empty() && inner.state != SessionState::Closed
            })
            .unwrap_or_else(PoisonError::into_inner);
        inner.inbox.pop_front()
    }

    /// Close the session and remove it from its manager; idempotent
    pub fn close(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_if_current(self);
        }
        if self.mark_closed() {
            log::info!("Session {}: closed", self.id);
        }
    }

    /// Mark closed, release the socket and wake both workers; `false` if
    /// already closed
    fn mark_closed(&self) -> bool {
        {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return false;
            }
            inner.state = SessionState::Closed;
            // Dropped under the state lock: whoever sees Closed can rebind the port
            drop(self.socket().take());
        }
        self.changed.notify_all();

        if let Err(e) = self.waker.wake() {
            log::debug!("Session {}: failed to wake listener: {}", self.id, e);
        }
        true
    }

    /// Wait until `done` holds or `deadline` passes, returning the state seen last
    fn wait_until(
        &self,
        deadline: Instant,
        done: impl Fn(&SessionInner) -> bool,
    ) -> SessionState {
        let guard = self.lock();
        let timeout = deadline.saturating_duration_since(Instant::now());
        let (inner, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |inner| !done(inner))
            .unwrap_or_else(PoisonError::into_inner);
        inner.state
    }

    fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Accept a hole-punch source, rebinding the remote address the first
    /// time it differs
    fn accept_source(&self, from: SocketAddr) -> bool {
        let mut inner = self.lock();
        if inner.remote_addr == from {
            inner.last_activity = Instant::now();
            return true;
        }
        if inner.rebound {
            return false;
        }

        log::info!(
            "Session {}: rebinding remote {} -> {}",
            self.id,
            inner.remote_addr,
            from
        );
        inner.remote_addr = from;
        inner.rebound = true;
        inner.last_activity = Instant::now();
        true
    }

    /// Accept a non-punch packet only from the current remote address
    fn from_remote(&self, from: SocketAddr) -> bool {
        let mut inner = self.lock();
        if inner.remote_addr != from {
            return false;
        }
        inner.last_activity = Instant::now();
        true
    }

    fn set_provisional(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Probing {
            inner.state = SessionState::Provisional;
            log::debug!("Session {}: provisional", self.id);
        }
    }

    fn set_established(&self) {
        {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Probing | SessionState::Provisional => {
                    inner.state = SessionState::Established;
                }
                SessionState::Established | SessionState::Closed => return,
            }
        }
        log::info!(
            "Session {}: established with {}",
            self.id,
            self.remote_addr()
        );
        self.changed.notify_all();
    }

    fn deliver(&self, payload: &[u8]) {
        {
            let mut inner = self.lock();
            if inner.inbox.len() >= INBOX_CAPACITY {
                log::warn!("Session {}: inbox full, dropping oldest packet", self.id);
                inner.inbox.pop_front();
            }
            inner.inbox.push_back(payload.to_vec());
        }
        self.changed.notify_all();
    }
}

// ============================================================================
// Manager
// ============================================================================

type SessionMap = HashMap<String, Arc<HolePunchSession>>;

#[derive(Debug)]
struct ManagerInner {
    config: HolePunchConfig,
    sessions: RwLock<SessionMap>,
}

/// Index of active hole-punch sessions
///
/// Cheap to clone; all clones share the same sessions.
#[derive(Debug, Clone)]
pub struct HolePunchManager {
    inner: Arc<ManagerInner>,
}

impl HolePunchManager {
    pub fn new(config: HolePunchConfig) -> Self {
        HolePunchManager {
            inner: Arc::new(ManagerInner {
                config,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.inner.config
    }

    /// Punch towards `remote` from a fresh ephemeral socket
    pub fn initiate_hole_punch(
        &self,
        remote: SocketAddr,
        session_id: &str,
    ) -> Result<Arc<HolePunchSession>, TraversalError> {
        let bind_addr: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = std::net::UdpSocket::bind(bind_addr)?;
        self.initiate_hole_punch_on(socket, remote, session_id)
    }

    /// Punch towards `remote` from an already bound socket
    ///
    /// Use this to punch from the port whose NAT mapping the peer was told about.
    pub fn initiate_hole_punch_on(
        &self,
        socket: std::net::UdpSocket,
        remote: SocketAddr,
        session_id: &str,
    ) -> Result<Arc<HolePunchSession>, TraversalError> {
        if self.read_sessions().contains_key(session_id) {
            return Err(TraversalError::SessionExists(session_id.to_string()));
        }

        let punch = packet::serialize(PacketType::HolePunch, session_id.as_bytes())?;

        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let mut socket = UdpSocket::from_std(socket);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let now = Instant::now();
        let session = Arc::new(HolePunchSession {
            id: session_id.to_string(),
            local_addr,
            socket: Mutex::new(Some(socket)),
            started: now,
            inner: Mutex::new(SessionInner {
                state: SessionState::Probing,
                remote_addr: remote,
                rebound: false,
                last_activity: now,
                inbox: VecDeque::new(),
            }),
            changed: Condvar::new(),
            waker,
            manager: Arc::downgrade(&self.inner),
        });

        {
            let mut sessions = self.write_sessions();
            if sessions.contains_key(session_id) {
                return Err(TraversalError::SessionExists(session_id.to_string()));
            }
            sessions.insert(session_id.to_string(), Arc::clone(&session));
        }

        log::info!(
            "Session {}: punching {} from {}",
            session_id,
            remote,
            local_addr
        );

        if let Err(e) = self.spawn_workers(&session, poll, punch) {
            self.close_session(session_id);
            return Err(e.into());
        }

        Ok(session)
    }

    fn spawn_workers(
        &self,
        session: &Arc<HolePunchSession>,
        poll: Poll,
        punch: Vec<u8>,
    ) -> io::Result<()> {
        let listener = Listener {
            manager: self.clone(),
            session: Arc::clone(session),
            poll,
        };
        thread::Builder::new()
            .name(format!("hp-listen-{}", session.id))
            .spawn(move || listener.run())?;

        let puncher = Puncher {
            manager: self.clone(),
            session: Arc::clone(session),
            punch,
        };
        thread::Builder::new()
            .name(format!("hp-punch-{}", session.id))
            .spawn(move || puncher.run())?;

        Ok(())
    }

    /// Remove and close a session; unknown IDs are ignored
    pub fn close_session(&self, session_id: &str) {
        let removed = self.write_sessions().remove(session_id);
        if let Some(session) = removed {
            if session.mark_closed() {
                log::info!("Session {}: closed", session_id);
            }
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = self.write_sessions().drain().collect();
        for (id, session) in drained {
            if session.mark_closed() {
                log::info!("Session {}: closed", id);
            }
        }
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<HolePunchSession>> {
        self.read_sessions().get(session_id).cloned()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.read_sessions().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_sessions().is_empty()
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.inner.read()
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.inner.write()
    }
}

impl ManagerInner {
    fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop `session` from the index only if it is still the entry for its ID
    fn remove_if_current(&self, session: &HolePunchSession) {
        let mut sessions = self.write();
        if sessions
            .get(&session.id)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
        {
            sessions.remove(&session.id);
        }
    }
}

// ============================================================================
// Punch Worker
// ============================================================================

struct Puncher {
    manager: HolePunchManager,
    session: Arc<HolePunchSession>,
    punch: Vec<u8>,
}

impl Puncher {
    fn run(self) {
        let config = self.manager.config().clone();
        let settled = |inner: &SessionInner| {
            matches!(
                inner.state,
                SessionState::Established | SessionState::Closed
            )
        };

        for attempt in 1..=config.retries {
            if settled(&*self.session.lock()) {
                break;
            }

            let remote = self.session.remote_addr();
            match self.session.send_raw(&self.punch, remote) {
                Ok(_) => log::debug!(
                    "Session {}: punch {}/{} -> {}",
                    self.session.id,
                    attempt,
                    config.retries,
                    remote
                ),
                Err(e) => log::debug!(
                    "Session {}: punch {}/{} failed: {}",
                    self.session.id,
                    attempt,
                    config.retries,
                    e
                ),
            }

            self.session
                .wait_until(Instant::now() + config.retry_delay, settled);
        }

        let deadline = self.session.started + config.timeout;
        match self.session.wait_until(deadline, settled) {
            SessionState::Established => {}
            SessionState::Closed => return,
            _ => {
                log::info!(
                    "Session {}: no acknowledgment within {:?}",
                    self.session.id,
                    config.timeout
                );
                self.session.close();
                return;
            }
        }

        loop {
            let state = self.session.wait_until(
                Instant::now() + config.keep_alive_interval,
                |inner| inner.state == SessionState::Closed,
            );
            if state == SessionState::Closed {
                break;
            }
            if let Err(e) = self.session.send_keep_alive() {
                log::debug!("Session {}: keep-alive failed: {}", self.session.id, e);
            }
        }

        log::trace!("Session {}: punch worker exiting", self.session.id);
    }
}

// ============================================================================
// Listen Worker
// ============================================================================

struct Listener {
    manager: HolePunchManager,
    session: Arc<HolePunchSession>,
    poll: Poll,
}

impl Listener {
    fn run(mut self) {
        let mut events = Events::with_capacity(16);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let read_deadline = self.session.started + self.manager.config().timeout;

        loop {
            let timeout = match self.session.state() {
                SessionState::Closed => break,
                SessionState::Established => None,
                SessionState::Probing | SessionState::Provisional => {
                    let left = read_deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        log::info!("Session {}: read deadline passed", self.session.id);
                        self.session.close();
                        break;
                    }
                    Some(left)
                }
            };

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("Session {}: poll failed: {}", self.session.id, e);
                self.session.close();
                break;
            }

            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    self.drain_socket(&mut buf);
                }
            }
        }

        log::trace!("Session {}: listen worker exiting", self.session.id);
    }

    fn drain_socket(&self, buf: &mut [u8]) {
        loop {
            let received = {
                let socket = self.session.socket();
                let result = match socket.as_ref() {
                    Some(socket) => socket.recv_from(buf),
                    None => break,
                };
                result
            };
            let (len, from) = match received {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // ICMP unreachable surfaces here on some platforms
                    log::debug!("Session {}: recv error: {}", self.session.id, e);
                    continue;
                }
            };
            self.handle_datagram(&buf[..len], from);
        }
    }

    fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let session = &self.session;

        let packet = match packet::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                log::debug!(
                    "Session {}: dropping malformed packet from {}: {}",
                    session.id,
                    from,
                    e
                );
                return;
            }
        };

        log::trace!(
            "Session {}: {} ({} bytes) from {}",
            session.id,
            packet.packet_type,
            packet.payload.len(),
            from
        );

        let accepted = match packet.packet_type {
            PacketType::HolePunch | PacketType::HolePunchAck => session.accept_source(from),
            _ => session.from_remote(from),
        };
        if !accepted {
            log::debug!(
                "Session {}: dropping {} from unexpected source {}",
                session.id,
                packet.packet_type,
                from
            );
            return;
        }

        match packet.packet_type {
            PacketType::HolePunch => {
                match packet::serialize(PacketType::HolePunchAck, session.id.as_bytes()) {
                    Ok(ack) => {
                        if let Err(e) = session.send_raw(&ack, from) {
                            log::debug!("Session {}: ack to {} failed: {}", session.id, from, e);
                        }
                    }
                    Err(e) => log::warn!("Session {}: cannot encode ack: {}", session.id, e),
                }
                session.set_provisional();
            }
            PacketType::HolePunchAck => session.set_established(),
            PacketType::KeepAlive => {}
            PacketType::Data => session.deliver(packet.payload),
            other => {
                log::debug!(
                    "Session {}: ignoring {} packet from {}",
                    session.id,
                    other,
                    from
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
