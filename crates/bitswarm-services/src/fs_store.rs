//! On-disk block store.
//!
//! Blocks are stored by CID in a two-level directory structure:
//!   {root}/{digest[0..2]}/{cid_hex}
//!
//! Files are immutable. If the path exists, the content is correct.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use bitswarm_core::{Block, ContentId};
use bytes::Bytes;
use memmap2::Mmap;

use crate::store::{verify_ingest, BlockStore};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// A temp path next to `path`, unique per write in this process.
fn temp_path(path: &Path) -> PathBuf {
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}-{}.tmp", std::process::id(), seq));
    path.with_file_name(name)
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create temp file: {}", path.display()))?;
    file.write_all(data).context("failed to write block data")?;
    file.sync_all().context("failed to sync block to disk")?;
    Ok(())
}

#[derive(Clone)]
pub struct FsBlockStore {
    root: PathBuf,
}

impl FsBlockStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create block root: {}", root.display()))?;
        Ok(Self { root })
    }

    fn block_path(&self, cid: &ContentId) -> PathBuf {
        let shard = hex::encode(&cid.digest()[..1]);
        self.root.join(shard).join(cid.to_string())
    }

    /// Count stored blocks (for stats).
    pub fn count(&self) -> usize {
        let mut total = 0;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    total += subdir
                        .flatten()
                        .filter(|f| f.path().extension().is_none())
                        .count();
                }
            }
        }
        total
    }

    /// Total stored bytes (for stats).
    pub fn total_bytes(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for block in subdir.flatten() {
                        if let Ok(meta) = block.metadata() {
                            total += meta.len();
                        }
                    }
                }
            }
        }
        total
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }
}

impl BlockStore for FsBlockStore {
    fn has(&self, cid: &ContentId) -> Result<bool> {
        Ok(self.block_path(cid).exists())
    }

    fn get(&self, cid: &ContentId) -> Result<Option<Block>> {
        let path = self.block_path(cid);
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open block: {}", path.display()))?;
        let len = file.metadata().context("failed to stat block")?.len();
        if len == 0 {
            // mmap of an empty file fails on some platforms
            return Ok(Some(Block::with_cid(*cid, Bytes::new())));
        }

        // Safety: blocks are written once via rename and never mutated in place
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap block: {}", path.display()))?
        };
        Ok(Some(Block::with_cid(*cid, Bytes::copy_from_slice(&mmap))))
    }

    /// Atomic write: temp file, then rename. Existing blocks are left alone.
    fn put(&self, block: &Block) -> Result<()> {
        verify_ingest(block)?;
        let path = self.block_path(block.cid());
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create block dir: {}", parent.display()))?;
        }

        let tmp_path = temp_path(&path);
        let written = write_synced(&tmp_path, block.data());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            // a concurrent writer of the same block got there first
            if path.exists() {
                return Ok(());
            }
            return Err(e).with_context(|| {
                format!("failed to rename {} to {}", tmp_path.display(), path.display())
            });
        }

        tracing::trace!(cid = %block.cid().short(), bytes = block.len(), "block stored");
        Ok(())
    }

    fn size(&self, cid: &ContentId) -> Result<Option<usize>> {
        match fs::metadata(self.block_path(cid)) {
            Ok(meta) => Ok(Some(meta.len() as usize)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to stat block"),
        }
    }

    fn delete(&self, cids: &[ContentId]) -> Result<()> {
        for cid in cids {
            let path = self.block_path(cid);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to delete block: {}", path.display()))
                }
            }
        }
        Ok(())
    }
}
