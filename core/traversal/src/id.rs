//! Random identifiers for connections and hole-punch sessions

use std::fmt::Write;

use ring::rand::{SecureRandom, SystemRandom};

/// Bytes of randomness in a connection ID (16 hex chars)
pub const CONNECTION_ID_BYTES: usize = 8;

/// Bytes of randomness in a peer ID (32 hex chars)
pub const PEER_ID_BYTES: usize = 16;

/// Generate `len` random bytes hex-encoded, or `None` if the system RNG fails
pub fn random_hex_id(len: usize) -> Option<String> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).ok()?;

    let mut out = String::with_capacity(len * 2);
    for byte in &buf {
        let _ = write!(out, "{:02x}", byte);
    }
    Some(out)
}

/// Generate a connection/session ID using CSPRNG
pub fn generate_connection_id() -> Option<String> {
    random_hex_id(CONNECTION_ID_BYTES)
}

/// Generate a peer ID using CSPRNG
pub fn generate_peer_id() -> Option<String> {
    random_hex_id(PEER_ID_BYTES)
}

/// Check that `id` is hex of exactly `expected_len` characters
pub fn is_valid_id(id: &str, expected_len: usize) -> bool {
    id.len() == expected_len && id.bytes().all(|b| b.is_ascii_hexdigit())
}
