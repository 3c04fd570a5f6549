//! Observed round-trip stats per peer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitswarm_core::PeerId;
use dashmap::DashMap;

/// What we have seen of a peer so far.
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// Smoothed latency hint, updated after each successful round trip.
    pub latency: Duration,
    pub round_trips: u64,
    pub last_seen: Instant,
}

/// Shared between the network layer (which records) and the daemon's
/// stats task (which reads).
#[derive(Clone, Default)]
pub struct PeerBook {
    peers: Arc<DashMap<PeerId, PeerStats>>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one round trip into the peer's latency hint.
    ///
    /// Uses an exponential moving average with weight 1/8 for the new sample,
    /// the first sample sets the hint directly.
    pub fn record_round_trip(&self, peer: PeerId, took: Duration) {
        let now = Instant::now();
        self.peers
            .entry(peer)
            .and_modify(|s| {
                s.latency = (s.latency * 7 + took) / 8;
                s.round_trips += 1;
                s.last_seen = now;
            })
            .or_insert(PeerStats {
                latency: took,
                round_trips: 1,
                last_seen: now,
            });
    }

    pub fn latency(&self, peer: &PeerId) -> Option<Duration> {
        self.peers.get(peer).map(|s| s.latency)
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerStats> {
        self.peers.get(peer).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
