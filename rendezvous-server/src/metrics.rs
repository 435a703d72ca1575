//! Lightweight Prometheus-compatible metrics for the rendezvous server.
//!
//! Atomic counters, rendered in Prometheus text exposition format for the
//! optional metrics endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Currently registered peers (gauge)
    pub active_peers: AtomicU64,
    /// Successful registrations, including refreshes (counter)
    pub registrations_total: AtomicU64,
    /// Introductions sent to both sides of a connection (counter)
    pub introductions_total: AtomicU64,
    /// Connect requests rejected, e.g. unknown target (counter)
    pub introduction_failures_total: AtomicU64,
    /// Traversals reported established (counter)
    pub traversals_established_total: AtomicU64,
    /// Traversals reported failed (counter)
    pub traversals_failed_total: AtomicU64,
    /// Datagrams dropped as malformed (counter)
    pub malformed_packets_total: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_peers: AtomicU64::new(0),
            registrations_total: AtomicU64::new(0),
            introductions_total: AtomicU64::new(0),
            introduction_failures_total: AtomicU64::new(0),
            traversals_established_total: AtomicU64::new(0),
            traversals_failed_total: AtomicU64::new(0),
            malformed_packets_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP rendezvous_active_peers Currently registered peers\n\
             # TYPE rendezvous_active_peers gauge\n\
             rendezvous_active_peers {}\n\
             # HELP rendezvous_registrations_total Total peer registrations\n\
             # TYPE rendezvous_registrations_total counter\n\
             rendezvous_registrations_total {}\n\
             # HELP rendezvous_introductions_total Total connection introductions\n\
             # TYPE rendezvous_introductions_total counter\n\
             rendezvous_introductions_total {}\n\
             # HELP rendezvous_introduction_failures_total Total rejected connect requests\n\
             # TYPE rendezvous_introduction_failures_total counter\n\
             rendezvous_introduction_failures_total {}\n\
             # HELP rendezvous_traversals_established_total Traversals reported established\n\
             # TYPE rendezvous_traversals_established_total counter\n\
             rendezvous_traversals_established_total {}\n\
             # HELP rendezvous_traversals_failed_total Traversals reported failed\n\
             # TYPE rendezvous_traversals_failed_total counter\n\
             rendezvous_traversals_failed_total {}\n\
             # HELP rendezvous_malformed_packets_total Datagrams dropped as malformed\n\
             # TYPE rendezvous_malformed_packets_total counter\n\
             rendezvous_malformed_packets_total {}\n\
             # HELP rendezvous_uptime_seconds Server uptime in seconds\n\
             # TYPE rendezvous_uptime_seconds gauge\n\
             rendezvous_uptime_seconds {}\n",
            self.active_peers.load(Ordering::Relaxed),
            self.registrations_total.load(Ordering::Relaxed),
            self.introductions_total.load(Ordering::Relaxed),
            self.introduction_failures_total.load(Ordering::Relaxed),
            self.traversals_established_total.load(Ordering::Relaxed),
            self.traversals_failed_total.load(Ordering::Relaxed),
            self.malformed_packets_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}
