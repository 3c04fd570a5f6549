//! Block storage seam.
//!
//! The exchange never touches disk directly; it talks to a [`BlockStore`].
//! Stores verify content on ingest, so anything handed back by `get` can be
//! trusted to match its CID.

use anyhow::Result;
use bitswarm_core::{Block, ContentId};
use dashmap::DashMap;

/// Content-addressed get/put/has/size/delete.
pub trait BlockStore: Send + Sync {
    fn has(&self, cid: &ContentId) -> Result<bool>;

    fn get(&self, cid: &ContentId) -> Result<Option<Block>>;

    /// Store a block. Rejects blocks whose data does not hash to their CID.
    fn put(&self, block: &Block) -> Result<()>;

    fn size(&self, cid: &ContentId) -> Result<Option<usize>>;

    fn delete(&self, cids: &[ContentId]) -> Result<()>;

    /// Resolve sizes for many CIDs in one pass.
    fn sizes(&self, cids: &[ContentId]) -> Result<Vec<Option<usize>>> {
        cids.iter().map(|cid| self.size(cid)).collect()
    }
}

pub(crate) fn verify_ingest(block: &Block) -> Result<()> {
    anyhow::ensure!(
        block.verify(),
        "block data does not hash to {}",
        block.cid().short()
    );
    Ok(())
}

/// In-memory store, used by tests and `storage.in_memory` nodes.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: DashMap<ContentId, Block>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl BlockStore for MemoryBlockStore {
    fn has(&self, cid: &ContentId) -> Result<bool> {
        Ok(self.blocks.contains_key(cid))
    }

    fn get(&self, cid: &ContentId) -> Result<Option<Block>> {
        Ok(self.blocks.get(cid).map(|b| b.value().clone()))
    }

    fn put(&self, block: &Block) -> Result<()> {
        verify_ingest(block)?;
        self.blocks.entry(*block.cid()).or_insert_with(|| block.clone());
        Ok(())
    }

    fn size(&self, cid: &ContentId) -> Result<Option<usize>> {
        Ok(self.blocks.get(cid).map(|b| b.len()))
    }

    fn delete(&self, cids: &[ContentId]) -> Result<()> {
        for cid in cids {
            self.blocks.remove(cid);
        }
        Ok(())
    }
}
