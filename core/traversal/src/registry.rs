//! Rendezvous-level connection registry
//!
//! Tracks connection requests between peers and their status:
//!
//! ```text
//! Initiated ──► Negotiating ──► Established ──► Closed
//!     │              │               │            ▲
//!     └──────────────┴───────────────┴─► Failed ──┘
//! ```
//!
//! A request never returns from `Failed` or `Closed` to an active status; a
//! retry is a new registration under a new ID. Stale requests are evicted by
//! [`ConnectionRegistry::cleanup_stale_connections`], either on demand or from
//! the background sweep started with [`ConnectionRegistry::start_cleanup`].

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::id::generate_connection_id;

// ============================================================================
// Connection Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Initiated,
    Negotiating,
    Established,
    Failed,
    Closed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Initiated => "initiated",
            ConnectionStatus::Negotiating => "negotiating",
            ConnectionStatus::Established => "established",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Closed => "closed",
        }
    }

    /// Position along the happy path
    fn rank(&self) -> u8 {
        match self {
            ConnectionStatus::Initiated => 0,
            ConnectionStatus::Negotiating => 1,
            ConnectionStatus::Established => 2,
            ConnectionStatus::Failed => 3,
            ConnectionStatus::Closed => 4,
        }
    }

    /// Whether a request in `self` may move to `to`
    pub fn can_transition_to(&self, to: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        match (*self, to) {
            (from, to) if from == to => true,
            (_, Closed) => true,
            (Closed, _) => false,
            (_, Failed) => true,
            (Failed, _) => false,
            (from, to) => to.rank() > from.rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Failed | ConnectionStatus::Closed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Connection Request
// ============================================================================

/// A request by `source_id` to connect to `target_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub status: ConnectionStatus,
    /// When the request was registered
    pub timestamp: SystemTime,
    pub last_updated: SystemTime,
    pub source_addr: Option<SocketAddr>,
    pub target_addr: Option<SocketAddr>,
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConnectionRequest {
    /// Whether `peer_id` is either end of this request
    pub fn involves(&self, peer_id: &str) -> bool {
        self.source_id == peer_id || self.target_id == peer_id
    }
}

/// Parameters for [`ConnectionRegistry::register_connection`]
#[derive(Debug, Clone, Default)]
pub struct NewConnection {
    /// Explicit ID; one is generated when `None`
    pub id: Option<String>,
    pub source_id: String,
    pub target_id: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewConnection {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        NewConnection {
            id: None,
            source_id: source_id.into(),
            target_id: target_id.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

struct RegistryInner {
    connections: RwLock<HashMap<String, ConnectionRequest>>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

struct Sweeper {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Thread-safe store of connection requests
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl ConnectionRegistry {
    /// Registry on the system clock
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        ConnectionRegistry {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(HashMap::new()),
                clock,
                config,
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Store a new request in `Initiated` and return its ID
    pub fn register_connection(&self, new: NewConnection) -> Result<String, RegistryError> {
        let now = self.inner.clock.now();
        let mut connections = self.inner.write();

        let id = match new.id {
            Some(id) => {
                if connections.contains_key(&id) {
                    return Err(RegistryError::DuplicateConnection(id));
                }
                id
            }
            None => loop {
                let id = generate_connection_id().ok_or(RegistryError::IdGeneration)?;
                if !connections.contains_key(&id) {
                    break id;
                }
            },
        };

        log::info!(
            "Registered connection {} ({} -> {})",
            id,
            new.source_id,
            new.target_id
        );

        connections.insert(
            id.clone(),
            ConnectionRequest {
                id: id.clone(),
                source_id: new.source_id,
                target_id: new.target_id,
                status: ConnectionStatus::Initiated,
                timestamp: now,
                last_updated: now,
                source_addr: None,
                target_addr: None,
                error: None,
                metadata: new.metadata,
            },
        );

        Ok(id)
    }

    /// Move a request to `status`
    ///
    /// Returns `Ok(false)` if the ID is unknown. Backward moves are rejected.
    pub fn update_connection_status(
        &self,
        id: &str,
        status: ConnectionStatus,
    ) -> Result<bool, RegistryError> {
        let now = self.inner.clock.now();
        let mut connections = self.inner.write();

        let Some(request) = connections.get_mut(id) else {
            return Ok(false);
        };

        if !request.status.can_transition_to(status) {
            return Err(RegistryError::InvalidTransition {
                from: request.status,
                to: status,
            });
        }

        if request.status != status {
            log::debug!("Connection {}: {} -> {}", id, request.status, status);
        }
        request.status = status;
        request.last_updated = now;
        Ok(true)
    }

    /// Mark a request failed with `message`; `false` if the ID is unknown
    pub fn update_connection_error(&self, id: &str, message: impl Into<String>) -> bool {
        let now = self.inner.clock.now();
        let mut connections = self.inner.write();

        let Some(request) = connections.get_mut(id) else {
            return false;
        };

        let message = message.into();
        log::info!("Connection {} failed: {}", id, message);
        request.status = ConnectionStatus::Failed;
        request.error = Some(message);
        request.last_updated = now;
        true
    }

    /// Record the addresses each side will traverse from
    pub fn set_addresses(
        &self,
        id: &str,
        source_addr: Option<SocketAddr>,
        target_addr: Option<SocketAddr>,
    ) -> bool {
        let now = self.inner.clock.now();
        self.modify(id, |request| {
            if source_addr.is_some() {
                request.source_addr = source_addr;
            }
            if target_addr.is_some() {
                request.target_addr = target_addr;
            }
            request.last_updated = now;
        })
    }

    pub fn set_metadata(&self, id: &str, key: impl Into<String>, value: serde_json::Value) -> bool {
        let now = self.inner.clock.now();
        let key = key.into();
        self.modify(id, |request| {
            request.metadata.insert(key, value);
            request.last_updated = now;
        })
    }

    pub fn remove_connection(&self, id: &str) -> bool {
        self.inner.write().remove(id).is_some()
    }

    pub fn get_connection(&self, id: &str) -> Option<ConnectionRequest> {
        self.inner.read().get(id).cloned()
    }

    /// Requests where `peer_id` is the source or the target
    pub fn connections_for(&self, peer_id: &str) -> Vec<ConnectionRequest> {
        self.inner
            .read()
            .values()
            .filter(|r| r.involves(peer_id))
            .cloned()
            .collect()
    }

    pub fn connections_with_status(&self, status: ConnectionStatus) -> Vec<ConnectionRequest> {
        self.inner
            .read()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Evict stale requests, returning how many were removed
    pub fn cleanup_stale_connections(&self) -> usize {
        self.inner.cleanup_stale()
    }

    /// Start the background sweep (every `cleanup_interval`)
    pub fn start_cleanup(&self) -> Result<(), RegistryError> {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_some() {
            return Err(RegistryError::SweeperRunning);
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let interval = inner.config.cleanup_interval;

        let handle = thread::Builder::new()
            .name("registry-sweep".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let removed = inner.cleanup_stale();
                        if removed > 0 {
                            log::info!("Registry sweep removed {} stale connections", removed);
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(RegistryError::Spawn)?;

        log::debug!("Registry sweep started (interval {:?})", interval);
        *sweeper = Some(Sweeper { stop, handle });
        Ok(())
    }

    /// Stop the background sweep and wait for it to exit; no-op if not running
    pub fn stop_cleanup(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Sweeper { stop, handle }) = sweeper {
            let _ = stop.send(());
            if handle.join().is_err() {
                log::warn!("Registry sweep thread panicked");
            }
            log::debug!("Registry sweep stopped");
        }
    }

    pub fn is_cleanup_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn modify(&self, id: &str, f: impl FnOnce(&mut ConnectionRequest)) -> bool {
        match self.inner.write().get_mut(id) {
            Some(request) => {
                f(request);
                true
            }
            None => false,
        }
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ConnectionRequest>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ConnectionRequest>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, request: &ConnectionRequest, now: SystemTime) -> bool {
        let age = |t: SystemTime| now.duration_since(t).unwrap_or(Duration::ZERO);

        match request.status {
            ConnectionStatus::Established => age(request.last_updated) > self.config.max_age,
            ConnectionStatus::Failed | ConnectionStatus::Closed => {
                age(request.last_updated) > self.config.failed_retention
            }
            ConnectionStatus::Initiated | ConnectionStatus::Negotiating => {
                age(request.timestamp) > self.config.max_age
            }
        }
    }

    fn cleanup_stale(&self) -> usize {
        let now = self.clock.now();
        let mut connections = self.write();
        let before = connections.len();

        connections.retain(|id, request| {
            let stale = self.is_stale(request, now);
            if stale {
                log::debug!("Evicting stale connection {} ({})", id, request.status);
            }
            !stale
        });

        before - connections.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
