//! Provider discovery seam.

use async_trait::async_trait;
use bitswarm_core::{ContentId, PeerId};
use tokio_util::sync::CancellationToken;

/// Finds peers that claim to hold a CID.
///
/// Implementations call `on_found` for each provider as it turns up and
/// return once the search is exhausted or `token` fires.
#[async_trait]
pub trait ProviderDiscovery: Send + Sync {
    async fn find_providers(
        &self,
        token: &CancellationToken,
        cid: &ContentId,
        on_found: &(dyn Fn(PeerId) + Send + Sync),
    ) -> anyhow::Result<()>;
}

/// Discovery that knows nothing.
pub struct NoDiscovery;

#[async_trait]
impl ProviderDiscovery for NoDiscovery {
    async fn find_providers(
        &self,
        _token: &CancellationToken,
        _cid: &ContentId,
        _on_found: &(dyn Fn(PeerId) + Send + Sync),
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Yields the same fixed peer list for every CID.
pub struct StaticProviders {
    peers: Vec<PeerId>,
}

impl StaticProviders {
    pub fn new(peers: Vec<PeerId>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl ProviderDiscovery for StaticProviders {
    async fn find_providers(
        &self,
        token: &CancellationToken,
        _cid: &ContentId,
        on_found: &(dyn Fn(PeerId) + Send + Sync),
    ) -> anyhow::Result<()> {
        for peer in &self.peers {
            if token.is_cancelled() {
                break;
            }
            on_found(*peer);
        }
        Ok(())
    }
}
