//! Records which peers asked us for which CIDs.
//!
//! One record per (CID, peer): a repeated want overwrites the earlier one.
//! Records leave on CANCEL or once they are older than [`RECORD_TTL`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bitswarm_core::{ContentId, PeerId, WantType};
use dashmap::DashMap;
use tokio::time::Instant;

/// How long an answered want is remembered.
pub const RECORD_TTL: Duration = Duration::from_secs(300);

/// Latest want from one peer for one CID.
#[derive(Debug, Clone)]
pub struct WantRecord {
    pub want_type: WantType,
    pub at: Instant,
}

#[derive(Clone, Default)]
pub struct WantTracker {
    wants: Arc<DashMap<ContentId, HashMap<PeerId, WantRecord>>>,
}

impl WantTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, cid: ContentId, peer: PeerId, want_type: WantType) {
        self.wants.entry(cid).or_default().insert(
            peer,
            WantRecord {
                want_type,
                at: Instant::now(),
            },
        );
    }

    /// Forget `peer`'s want for `cid`.
    pub fn cancel(&self, cid: &ContentId, peer: &PeerId) {
        let emptied = match self.wants.get_mut(cid) {
            Some(mut records) => {
                records.remove(peer);
                records.is_empty()
            }
            None => false,
        };
        if emptied {
            self.wants.remove_if(cid, |_, records| records.is_empty());
        }
    }

    /// Drop records older than `max_age`. Returns how many were dropped.
    pub fn prune(&self, max_age: Duration) -> usize {
        let mut dropped = 0;
        self.wants.retain(|_, records| {
            let before = records.len();
            records.retain(|_, r| r.at.elapsed() < max_age);
            dropped += before - records.len();
            !records.is_empty()
        });
        if dropped > 0 {
            tracing::debug!(dropped, "stale want records pruned");
        }
        dropped
    }

    /// How many peers currently want this CID.
    pub fn want_count(&self, cid: &ContentId) -> usize {
        self.wants.get(cid).map(|v| v.len()).unwrap_or(0)
    }

    pub fn wanted_by(&self, cid: &ContentId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .wants
            .get(cid)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    pub fn want_type(&self, cid: &ContentId, peer: &PeerId) -> Option<WantType> {
        self.wants
            .get(cid)
            .and_then(|v| v.get(peer).map(|r| r.want_type))
    }

    pub fn tracked_cids(&self) -> usize {
        self.wants.len()
    }

    pub fn log_stats(&self) {
        let mut total = 0usize;
        let mut block_wants = 0usize;
        let mut peers = HashSet::new();

        for entry in self.wants.iter() {
            for (peer, record) in entry.value() {
                total += 1;
                if record.want_type == WantType::Block {
                    block_wants += 1;
                }
                peers.insert(*peer);
            }
        }

        if total > 0 {
            tracing::info!(
                cids = self.wants.len(),
                wants = total,
                want_blocks = block_wants,
                peers = peers.len(),
                "want tracker stats"
            );
        }
    }
}
