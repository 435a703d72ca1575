//! Engine configuration
//!
//! Loaded from a JSON file; every field has a default so a partial file (or
//! no file) is valid. Durations are written in milliseconds.
//!
//! ```json
//! {
//!   "hole_punch": { "retries": 5, "retry_delay_ms": 500 },
//!   "registry": { "max_age_ms": 1800000 },
//!   "preferred_protocol": "udp"
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::strategy::Protocol;

// ============================================================================
// Sections
// ============================================================================

/// Hole-punch retry and timeout tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Number of hole-punch packets sent before waiting for the final timeout
    pub retries: u32,
    /// Delay between hole-punch packets
    #[serde(rename = "retry_delay_ms", with = "millis")]
    pub retry_delay: Duration,
    /// Overall time allowed for the punch to be acknowledged
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Keep-alive period once established
    #[serde(rename = "keep_alive_interval_ms", with = "millis")]
    pub keep_alive_interval: Duration,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        HolePunchConfig {
            retries: 5,
            retry_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(10),
        }
    }
}

/// Connection registry staleness policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often the background sweep runs
    #[serde(rename = "cleanup_interval_ms", with = "millis")]
    pub cleanup_interval: Duration,
    /// Age after which negotiating and quiet established requests are evicted
    #[serde(rename = "max_age_ms", with = "millis")]
    pub max_age: Duration,
    /// Age after which failed and closed requests are evicted
    #[serde(rename = "failed_retention_ms", with = "millis")]
    pub failed_retention: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            cleanup_interval: Duration::from_secs(5 * 60),
            max_age: Duration::from_secs(30 * 60),
            failed_retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Public address discovery server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    pub server: String,
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    pub retries: u32,
}

impl Default for StunConfig {
    fn default() -> Self {
        StunConfig {
            server: "stun.l.google.com:19302".to_string(),
            timeout: Duration::from_secs(5),
            retries: 3,
        }
    }
}

/// TCP simultaneous open tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            connect_timeout: Duration::from_secs(3),
        }
    }
}

// ============================================================================
// Top Level
// ============================================================================

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub hole_punch: HolePunchConfig,
    pub registry: RegistryConfig,
    pub stun: StunConfig,
    pub tcp: TcpConfig,
    /// Soft protocol filter for strategy selection (`None` = no preference)
    pub preferred_protocol: Option<Protocol>,
    /// Deadline for a single strategy's establish attempt
    #[serde(rename = "traversal_timeout_ms", with = "millis")]
    pub traversal_timeout: Duration,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        TraversalConfig {
            hole_punch: HolePunchConfig::default(),
            registry: RegistryConfig::default(),
            stun: StunConfig::default(),
            tcp: TcpConfig::default(),
            preferred_protocol: None,
            traversal_timeout: Duration::from_secs(30),
        }
    }
}

impl TraversalConfig {
    /// Load a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Apply environment overrides (`STUN_SERVER`, `TRAVERSAL_PREFERRED_PROTOCOL`)
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup("STUN_SERVER").filter(|s| !s.is_empty()) {
            self.stun.server = server;
        }

        if let Some(proto) = lookup("TRAVERSAL_PREFERRED_PROTOCOL") {
            if proto.is_empty() {
                self.preferred_protocol = None;
            } else {
                match proto.parse() {
                    Ok(p) => self.preferred_protocol = Some(p),
                    Err(e) => log::warn!("Ignoring TRAVERSAL_PREFERRED_PROTOCOL: {}", e),
                }
            }
        }
    }
}

/// Serialize a `Duration` as integer milliseconds
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

// ============================================================================
// Tests
// ============================================================================
