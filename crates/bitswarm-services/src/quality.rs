//! Peer quality: who is worth asking and who may push blocks.
//!
//! Two sets, guarded together:
//! - Priority set: peers believed likely to hold blocks. Grows as peers
//!   answer HAVE; shrinks only when a probe to the peer fails at the
//!   connection level.
//! - Whitelist: peers allowed to push blocks we never explicitly asked
//!   them for. A peer lands here once we have probed it.
//!
//! Fresh peers are in neither set, so [`PeerQuality::gate`] rejects them.

use std::collections::{BTreeSet, HashSet};

use bitswarm_core::PeerId;
use parking_lot::RwLock;

#[derive(Default)]
struct Sets {
    priority: BTreeSet<PeerId>,
    whitelist: HashSet<PeerId>,
}

#[derive(Default)]
pub struct PeerQuality {
    sets: RwLock<Sets>,
}

impl PeerQuality {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allow peers listed in config. Unparseable ids are skipped.
    pub fn apply_config(&self, trusted_peers: &[String]) {
        let mut sets = self.sets.write();
        for hex_id in trusted_peers {
            match hex_id.parse::<PeerId>() {
                Ok(peer) => {
                    sets.whitelist.insert(peer);
                    tracing::info!(peer = %peer.short(), "pre-allowed peer from config");
                }
                Err(_) => tracing::warn!(peer = %hex_id, "ignoring malformed trusted peer id"),
            }
        }
    }

    /// Add a peer to the priority set. Returns true if it was new.
    pub fn promote(&self, peer: PeerId) -> bool {
        let added = self.sets.write().priority.insert(peer);
        if added {
            tracing::debug!(peer = %peer.short(), "peer promoted");
        }
        added
    }

    pub fn promote_all(&self, peers: impl IntoIterator<Item = PeerId>) {
        let mut sets = self.sets.write();
        sets.priority.extend(peers);
    }

    /// Drop a peer from the priority set.
    pub fn demote(&self, peer: &PeerId) {
        if self.sets.write().priority.remove(peer) {
            tracing::debug!(peer = %peer.short(), "peer demoted");
        }
    }

    pub fn allow(&self, peer: PeerId) {
        self.sets.write().whitelist.insert(peer);
    }

    /// Remove a peer from the whitelist.
    pub fn revoke(&self, peer: &PeerId) {
        if self.sets.write().whitelist.remove(peer) {
            tracing::debug!(peer = %peer.short(), "peer revoked");
        }
    }

    pub fn is_allowed(&self, peer: &PeerId) -> bool {
        self.sets.read().whitelist.contains(peer)
    }

    pub fn is_priority(&self, peer: &PeerId) -> bool {
        self.sets.read().priority.contains(peer)
    }

    /// Admission check for unsolicited blocks. True means reject.
    pub fn gate(&self, peer: &PeerId) -> bool {
        !self.is_allowed(peer)
    }

    /// Snapshot of the priority set, in peer order.
    pub fn priority_peers(&self) -> Vec<PeerId> {
        self.sets.read().priority.iter().copied().collect()
    }

    /// (priority, whitelisted)
    pub fn counts(&self) -> (usize, usize) {
        let sets = self.sets.read();
        (sets.priority.len(), sets.whitelist.len())
    }

    pub fn clear(&self) {
        let mut sets = self.sets.write();
        sets.priority.clear();
        sets.whitelist.clear();
    }
}
