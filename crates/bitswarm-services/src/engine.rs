//! Exchange engine: the server role.
//!
//! For every inbound want-list the engine decides, per entry, whether to
//! answer with the full block, a HAVE, a DONT_HAVE, or nothing, and sends
//! all answers back to the requester as one message.

use std::sync::Arc;

use bitswarm_core::config::ExchangeSettings;
use bitswarm_core::{ContentId, Message, PeerId, WantEntry, WantType};
use tokio_util::sync::CancellationToken;

use crate::network::{ExchangeNetwork, SendPriority};
use crate::store::BlockStore;
use crate::wants::WantTracker;

pub struct Engine {
    local: PeerId,
    store: Arc<dyn BlockStore>,
    network: Arc<ExchangeNetwork>,
    send_dont_haves: bool,
    small_block_threshold: usize,
    wants: WantTracker,
}

impl Engine {
    pub fn new(
        store: Arc<dyn BlockStore>,
        network: Arc<ExchangeNetwork>,
        settings: &ExchangeSettings,
    ) -> Self {
        Self {
            local: network.local_peer(),
            store,
            network,
            send_dont_haves: settings.send_dont_haves,
            small_block_threshold: settings.max_block_size_replace_has_with_block,
            wants: WantTracker::new(),
        }
    }

    pub fn wants(&self) -> &WantTracker {
        &self.wants
    }

    /// Answer `message` from `peer`. Send failures are logged and dropped.
    pub async fn message_received(&self, token: &CancellationToken, peer: PeerId, message: &Message) {
        let Some(response) = self.respond(peer, message) else {
            return;
        };

        if let Err(e) = self
            .network
            .send_message(token, peer, &response, SendPriority::Normal)
            .await
        {
            tracing::debug!(
                peer = %peer.short(),
                blocks = response.blocks().len(),
                error = %e,
                "response dropped"
            );
        }
    }

    /// Build the response for `message`, or None if there is nothing to say.
    pub fn respond(&self, peer: PeerId, message: &Message) -> Option<Message> {
        let (wants, cancels): (Vec<&WantEntry>, Vec<&WantEntry>) =
            message.wantlist().iter().partition(|e| !e.cancel);

        for entry in &cancels {
            self.wants.cancel(&entry.cid, &peer);
        }
        if wants.is_empty() {
            return None;
        }

        let cids: Vec<ContentId> = wants.iter().map(|e| e.cid).collect();
        let sizes = match self.store.sizes(&cids) {
            Ok(sizes) => sizes,
            Err(e) => {
                tracing::warn!(peer = %peer.short(), error = %e, "size lookup failed");
                return None;
            }
        };

        let mut response = Message::new();
        for (entry, size) in wants.iter().zip(sizes) {
            self.wants.record(entry.cid, peer, entry.want_type);
            tracing::trace!(
                local = %self.local.short(),
                peer = %peer.short(),
                cid = %entry.cid.short(),
                want = ?entry.want_type,
                found = size.is_some(),
                "want received"
            );

            match size {
                None => {
                    if self.send_dont_haves && entry.send_dont_have {
                        response.add_dont_have(entry.cid);
                    }
                }
                Some(size) if self.answer_with_block(entry.want_type, size) => {
                    match self.store.get(&entry.cid) {
                        Ok(Some(block)) => response.add_block(block),
                        Ok(None) => response.add_dont_have(entry.cid),
                        Err(e) => {
                            tracing::warn!(cid = %entry.cid.short(), error = %e, "block read failed");
                            response.add_dont_have(entry.cid);
                        }
                    }
                }
                Some(_) => response.add_have(entry.cid),
            }
        }

        if response.is_empty() {
            return None;
        }
        response.set_pending_bytes(0);
        Some(response)
    }

    fn answer_with_block(&self, want_type: WantType, size: usize) -> bool {
        want_type == WantType::Block || size <= self.small_block_threshold
    }
}
