//! Bookkeeping for one in-progress block retrieval.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bitswarm_core::{ContentId, PeerId};
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct FetchState {
    have_probed: HashSet<PeerId>,
    want_probed: HashSet<PeerId>,
    candidates: VecDeque<PeerId>,
    last_discovery: Option<Instant>,
}

pub struct PendingFetch {
    cid: ContentId,
    created: Instant,
    state: Mutex<FetchState>,
    changed: Notify,
}

impl PendingFetch {
    pub fn new(cid: ContentId) -> Self {
        Self {
            cid,
            created: Instant::now(),
            state: Mutex::new(FetchState::default()),
            changed: Notify::new(),
        }
    }

    /// Start a fresh round that inherits the candidates an earlier round
    /// never got to.
    pub fn succeeding(previous: &PendingFetch) -> Self {
        let fetch = Self::new(previous.cid);
        fetch.state.lock().candidates = previous.state.lock().candidates.clone();
        fetch
    }

    pub fn cid(&self) -> &ContentId {
        &self.cid
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Record a HAVE probe. False if the peer was already probed.
    pub fn mark_have_probed(&self, peer: PeerId) -> bool {
        self.state.lock().have_probed.insert(peer)
    }

    /// Record a WANT-BLOCK request. False if one was already sent.
    pub fn mark_want_probed(&self, peer: PeerId) -> bool {
        self.state.lock().want_probed.insert(peer)
    }

    pub fn was_have_probed(&self, peer: &PeerId) -> bool {
        self.state.lock().have_probed.contains(peer)
    }

    pub fn was_want_probed(&self, peer: &PeerId) -> bool {
        self.state.lock().want_probed.contains(peer)
    }

    /// Queue a peer that claims to hold the block. FIFO by arrival.
    pub fn push_candidate(&self, peer: PeerId) {
        {
            let mut state = self.state.lock();
            if state.want_probed.contains(&peer) || state.candidates.contains(&peer) {
                return;
            }
            state.candidates.push_back(peer);
        }
        self.changed.notify_one();
    }

    pub fn pop_candidate(&self) -> Option<PeerId> {
        self.state.lock().candidates.pop_front()
    }

    pub fn has_candidates(&self) -> bool {
        !self.state.lock().candidates.is_empty()
    }

    /// True if discovery has never run, or last ran more than `interval` ago.
    pub fn discovery_due(&self, interval: Duration) -> bool {
        match self.state.lock().last_discovery {
            None => true,
            Some(at) => at.elapsed() >= interval,
        }
    }

    pub fn mark_discovery(&self) {
        self.state.lock().last_discovery = Some(Instant::now());
    }

    /// Signalled whenever a candidate is queued.
    pub fn changed(&self) -> &Notify {
        &self.changed
    }
}
