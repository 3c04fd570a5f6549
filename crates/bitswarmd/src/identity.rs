//! Node identity persisted as a hex peer id.

use std::path::Path;

use anyhow::{Context, Result};
use bitswarm_core::PeerId;

/// Read the peer id at `path`, generating and writing one if missing.
pub fn load_or_create(path: &Path) -> Result<PeerId> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read identity: {}", path.display()))?;
        return text
            .trim()
            .parse()
            .with_context(|| format!("malformed identity in {}", path.display()));
    }

    let peer = PeerId::random();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{peer}\n"))
        .with_context(|| format!("failed to write identity: {}", path.display()))?;
    tracing::info!(peer = %peer.short(), path = %path.display(), "generated node identity");
    Ok(peer)
}
