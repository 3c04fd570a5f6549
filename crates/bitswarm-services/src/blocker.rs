//! Per-CID wait/notify and per-CID mutual exclusion.

use std::sync::Arc;

use bitswarm_core::ContentId;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

/// Wakes callers waiting on a CID once its block lands in the store.
///
/// Waiters must `enable()` their `Notified` future before re-checking the
/// store, otherwise a release between check and wait is lost.
#[derive(Default)]
pub struct Blocker {
    waiters: DashMap<ContentId, Arc<Notify>>,
}

impl Blocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, cid: ContentId) -> Arc<Notify> {
        self.waiters.entry(cid).or_default().clone()
    }

    /// Wake everyone waiting on `cid`. Later subscribers get a fresh handle.
    pub fn release(&self, cid: &ContentId) {
        if let Some((_, notify)) = self.waiters.remove(cid) {
            notify.notify_waiters();
        }
    }

    pub fn release_all(&self) {
        let cids: Vec<ContentId> = self.waiters.iter().map(|e| *e.key()).collect();
        for cid in cids {
            self.release(&cid);
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }
}

/// Async mutex per CID. Unrelated CIDs never contend.
#[derive(Clone, Default)]
pub struct CidLocks {
    locks: Arc<DashMap<ContentId, Arc<Mutex<()>>>>,
}

/// Held for the duration of one probing round.
pub struct CidGuard {
    cid: ContentId,
    locks: Arc<DashMap<ContentId, Arc<Mutex<()>>>>,
    _held: OwnedMutexGuard<()>,
}

impl CidLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, cid: ContentId) -> CidGuard {
        let mutex = self.locks.entry(cid).or_default().clone();
        let held = mutex.lock_owned().await;
        CidGuard {
            cid,
            locks: self.locks.clone(),
            _held: held,
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for CidGuard {
    fn drop(&mut self) {
        // map + this guard; anyone else still queued keeps the entry alive
        self.locks
            .remove_if(&self.cid, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}
