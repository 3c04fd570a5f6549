//! Content manager: the client role.
//!
//! `get_block` runs at most one probing round per CID. A round HAVE-probes
//! every priority peer once, sends a WANT-BLOCK to each peer that answers
//! HAVE, re-runs provider discovery on an interval, and ends when the block
//! lands in the store or the caller's token fires.
//!
//! Probe failures never reach the caller. They only move peers in or out of
//! the priority set and whitelist.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitswarm_core::config::ExchangeSettings;
use bitswarm_core::{Block, ContentId, Message, PeerId};
use dashmap::{DashMap, DashSet};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::blocker::{Blocker, CidLocks};
use crate::discovery::ProviderDiscovery;
use crate::error::{ExchangeError, Result};
use crate::fetch::PendingFetch;
use crate::network::{ExchangeNetwork, SendPriority};
use crate::quality::PeerQuality;
use crate::store::BlockStore;

/// Live counters for the client role, bumped as probes, WANT-BLOCKs,
/// discovery runs and inbound blocks/HAVEs happen.
#[derive(Default)]
pub struct ProbeStats {
    have_probes: AtomicU64,
    want_blocks: AtomicU64,
    discovery_runs: AtomicU64,
    blocks_received: AtomicU64,
    haves_received: AtomicU64,
}

/// Point-in-time copy of [`ProbeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSnapshot {
    pub have_probes: u64,
    pub want_blocks: u64,
    pub discovery_runs: u64,
    pub blocks_received: u64,
    pub haves_received: u64,
}

impl ProbeStats {
    pub fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            have_probes: self.have_probes.load(Ordering::Relaxed),
            want_blocks: self.want_blocks.load(Ordering::Relaxed),
            discovery_runs: self.discovery_runs.load(Ordering::Relaxed),
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            haves_received: self.haves_received.load(Ordering::Relaxed),
        }
    }
}

pub struct ContentManager {
    store: Arc<dyn BlockStore>,
    network: Arc<ExchangeNetwork>,
    discovery: Arc<dyn ProviderDiscovery>,
    quality: Arc<PeerQuality>,
    blocker: Blocker,
    locks: CidLocks,
    fetches: DashMap<ContentId, Arc<PendingFetch>>,
    loads: Arc<DashSet<ContentId>>,
    provider_permits: Arc<Semaphore>,
    want_permits: Semaphore,
    stats: Arc<ProbeStats>,
    provider_refresh: Duration,
    probe_interval: Duration,
}

impl ContentManager {
    pub fn new(
        store: Arc<dyn BlockStore>,
        network: Arc<ExchangeNetwork>,
        discovery: Arc<dyn ProviderDiscovery>,
        quality: Arc<PeerQuality>,
        settings: &ExchangeSettings,
    ) -> Self {
        Self {
            store,
            network,
            discovery,
            quality,
            blocker: Blocker::new(),
            locks: CidLocks::new(),
            fetches: DashMap::new(),
            loads: Arc::new(DashSet::new()),
            provider_permits: Arc::new(Semaphore::new(settings.provider_workers.max(1))),
            want_permits: Semaphore::new(settings.want_workers.max(1)),
            stats: Arc::new(ProbeStats::default()),
            provider_refresh: settings.provider_refresh(),
            probe_interval: settings.probe_interval(),
        }
    }

    pub fn stats(&self) -> ProbeSnapshot {
        self.stats.snapshot()
    }

    pub fn quality(&self) -> &Arc<PeerQuality> {
        &self.quality
    }

    /// True while a round for `cid` is registered.
    pub fn is_fetching(&self, cid: &ContentId) -> bool {
        self.fetches.contains_key(cid)
    }

    pub fn pending_fetches(&self) -> usize {
        self.fetches.len()
    }

    /// Fetch a block, waiting for it until found or `token` fires.
    ///
    /// Callers for a CID that is already being fetched wait for that round
    /// to finish and then find the block in the store.
    pub async fn get_block(
        &self,
        token: &CancellationToken,
        cid: ContentId,
        is_root: bool,
    ) -> Result<Block> {
        if token.is_cancelled() {
            return Err(ExchangeError::Cancelled);
        }
        let _lock = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ExchangeError::Cancelled),
            guard = self.locks.lock(cid) => guard,
        };

        let result = self.run_round(token, cid, is_root).await;
        self.blocker.release(&cid);
        result
    }

    async fn run_round(
        &self,
        token: &CancellationToken,
        cid: ContentId,
        is_root: bool,
    ) -> Result<Block> {
        if let Some(block) = self.store.get(&cid)? {
            return Ok(block);
        }

        let mut fetch = self.register(cid);
        // discovery and probes spawned for this round stop when it ends
        let round = token.child_token();
        let _round_guard = round.clone().drop_guard();
        let enter = Instant::now();
        tracing::info!(cid = %cid.short(), root = is_root, "block get");

        self.quality.promote_all(self.network.connected_peers());
        if is_root {
            self.load_providers(&round, cid);
        }
        fetch.mark_discovery();

        loop {
            if round.is_cancelled() {
                tracing::debug!(cid = %cid.short(), "block get cancelled");
                return Err(ExchangeError::Cancelled);
            }

            let notify = self.blocker.subscribe(cid);
            let released = notify.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(block) = self.store.get(&cid)? {
                self.fetches.remove_if(&cid, |_, f| Arc::ptr_eq(f, &fetch));
                tracing::info!(
                    cid = %cid.short(),
                    took_ms = enter.elapsed().as_millis() as u64,
                    "block found"
                );
                return Ok(block);
            }

            // reset() dropped this round's record; carry on with a fresh one
            if !self.is_current(&cid, &fetch) {
                // block_received also drops the record, after storing
                if let Some(block) = self.store.get(&cid)? {
                    return Ok(block);
                }
                tracing::debug!(cid = %cid.short(), "fetch record reset, re-registering");
                fetch = self.register(cid);
                self.quality.promote_all(self.network.connected_peers());
                fetch.mark_discovery();
            }

            self.probe_priority_peers(&round, &fetch);

            if fetch.discovery_due(self.provider_refresh) {
                self.load_providers(&round, cid);
                fetch.mark_discovery();
            }

            if let Some(peer) = fetch.pop_candidate() {
                if fetch.mark_want_probed(peer) {
                    fetch.mark_have_probed(peer);
                    self.request_block(&round, peer, cid).await;
                }
                continue;
            }

            tokio::select! {
                _ = round.cancelled() => {}
                _ = &mut released => {}
                _ = fetch.changed().notified() => {}
                _ = tokio::time::sleep(self.probe_interval) => {}
            }
        }
    }

    /// Install a fresh record for `cid`, inheriting unvisited candidates
    /// from a round that was cancelled.
    fn register(&self, cid: ContentId) -> Arc<PendingFetch> {
        let fetch = self
            .fetches
            .get(&cid)
            .map(|previous| PendingFetch::succeeding(&previous))
            .unwrap_or_else(|| PendingFetch::new(cid));
        let fetch = Arc::new(fetch);
        self.fetches.insert(cid, fetch.clone());
        fetch
    }

    fn is_current(&self, cid: &ContentId, fetch: &Arc<PendingFetch>) -> bool {
        self.fetches
            .get(cid)
            .is_some_and(|current| Arc::ptr_eq(current.value(), fetch))
    }

    fn probe_priority_peers(&self, round: &CancellationToken, fetch: &PendingFetch) {
        let local = self.network.local_peer();
        for peer in self.quality.priority_peers() {
            if peer != local && fetch.mark_have_probed(peer) {
                self.spawn_have_probe(round.clone(), peer, vec![*fetch.cid()]);
            }
        }
    }

    /// Fire-and-forget HAVE probe. Success whitelists the peer; a connection
    /// failure drops it from the priority set.
    fn spawn_have_probe(&self, token: CancellationToken, peer: PeerId, cids: Vec<ContentId>) {
        self.stats.have_probes.fetch_add(1, Ordering::Relaxed);
        let network = self.network.clone();
        let quality = self.quality.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let message = Message::want_haves(&cids);
            let result = network
                .send_message(&token, peer, &message, SendPriority::Urgent)
                .await;
            let ok = result.is_ok();
            match result {
                Ok(()) => quality.allow(peer),
                Err(ExchangeError::Cancelled) | Err(ExchangeError::TimeoutIssue(_)) => {}
                Err(e) => {
                    quality.demote(&peer);
                    tracing::debug!(peer = %peer.short(), error = %e, "priority peer dropped");
                }
            }
            tracing::debug!(
                peer = %peer.short(),
                cids = cids.len(),
                ok,
                took_ms = start.elapsed().as_millis() as u64,
                "have probe finished"
            );
        });
    }

    /// Ask a matched peer for the block itself.
    async fn request_block(&self, round: &CancellationToken, peer: PeerId, cid: ContentId) {
        self.quality.promote(peer);
        self.quality.allow(peer);

        let _permit = tokio::select! {
            _ = round.cancelled() => return,
            permit = self.want_permits.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        self.stats.want_blocks.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let message = Message::want_blocks(&[cid]);
        match self
            .network
            .send_message(round, peer, &message, SendPriority::Urgent)
            .await
        {
            Ok(()) => {}
            Err(ExchangeError::Cancelled) => {}
            Err(ExchangeError::ProtocolIssue(issue)) => {
                tracing::debug!(peer = %peer.short(), cid = %cid.short(), %issue, "want refused");
            }
            Err(e) => {
                self.quality.revoke(&peer);
                tracing::warn!(peer = %peer.short(), cid = %cid.short(), error = %e, "want failed");
            }
        }
        tracing::debug!(
            peer = %peer.short(),
            cid = %cid.short(),
            took_ms = start.elapsed().as_millis() as u64,
            "match peer"
        );
    }

    /// Kick provider discovery for `cid` unless a search is already running.
    fn load_providers(&self, round: &CancellationToken, cid: ContentId) {
        if !self.loads.insert(cid) {
            return;
        }
        self.stats.discovery_runs.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cid = %cid.short(), "provider search start");

        let token = round.clone();
        let discovery = self.discovery.clone();
        let quality = self.quality.clone();
        let loads = self.loads.clone();
        let permits = self.provider_permits.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let permit = tokio::select! {
                _ = token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            if permit.is_some() && !token.is_cancelled() {
                let on_found = |peer: PeerId| {
                    quality.promote(peer);
                };
                if let Err(e) = discovery.find_providers(&token, &cid, &on_found).await {
                    tracing::warn!(cid = %cid.short(), error = %e, "provider search failed");
                }
            }
            loads.remove(&cid);
            tracing::debug!(
                cid = %cid.short(),
                took_ms = start.elapsed().as_millis() as u64,
                "provider search finish"
            );
        });
    }

    /// Store a block delivered by `peer` and wake whoever waits for it.
    pub fn block_received(&self, peer: PeerId, block: &Block) {
        let cid = *block.cid();
        self.stats.blocks_received.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.store.put(block) {
            tracing::warn!(peer = %peer.short(), cid = %cid.short(), error = %e, "block rejected");
            return;
        }
        tracing::info!(peer = %peer.short(), cid = %cid.short(), "block received");

        if let Some((_, fetch)) = self.fetches.remove(&cid) {
            self.quality.promote(peer);
            fetch.changed().notify_one();
        }
        self.blocker.release(&cid);
    }

    /// Queue `peer` as a candidate for every listed CID being fetched.
    pub fn have_received(&self, peer: PeerId, cids: &[ContentId]) {
        for cid in cids {
            let Some(fetch) = self.fetches.get(cid).map(|f| f.value().clone()) else {
                continue;
            };
            self.stats.haves_received.fetch_add(1, Ordering::Relaxed);
            tracing::info!(peer = %peer.short(), cid = %cid.short(), "have received");
            fetch.push_candidate(peer);
            self.quality.promote(peer);
        }
    }

    /// True means reject unsolicited blocks from `peer`.
    pub fn gate_peer(&self, peer: &PeerId) -> bool {
        self.quality.gate(peer)
    }

    /// Best-effort warm-up: one HAVE batch per priority peer, no waiting.
    pub fn load_blocks(&self, token: &CancellationToken, cids: &[ContentId]) {
        if cids.is_empty() || token.is_cancelled() {
            return;
        }
        tracing::debug!(cids = cids.len(), "load blocks");
        let local = self.network.local_peer();
        for peer in self.quality.priority_peers() {
            if peer != local {
                self.spawn_have_probe(token.clone(), peer, cids.to_vec());
            }
        }
    }

    /// Forget all peer quality and in-flight bookkeeping. Rounds still
    /// running re-register and keep going.
    pub fn reset(&self) {
        tracing::debug!("reset");
        self.loads.clear();
        self.quality.clear();
        self.fetches.clear();
        self.blocker.release_all();
    }
}
