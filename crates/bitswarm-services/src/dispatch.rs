//! The public surface of one exchange node.
//!
//! Every inbound message goes to both roles: blocks and HAVEs feed the
//! content manager, wants feed the engine. Outbound traffic from both
//! roles goes through the single [`ExchangeNetwork`] owned here.

use std::sync::Arc;

use bitswarm_core::config::ExchangeSettings;
use bitswarm_core::wire::{
    self, Frame, EXCHANGE_PROTOCOL, MAX_MESSAGE_SIZE, MAX_TOKEN_LEN, STREAM_PROTOCOL,
};
use bitswarm_core::{Block, ContentId, Message, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::content_manager::{ContentManager, ProbeSnapshot};
use crate::discovery::ProviderDiscovery;
use crate::engine::Engine;
use crate::error::{ExchangeError, Result};
use crate::network::{BoxStream, ExchangeNetwork, InboundStreams, SendPriority, Transport};
use crate::peer::PeerBook;
use crate::quality::PeerQuality;
use crate::store::BlockStore;
use crate::wants::{WantTracker, RECORD_TTL};

/// Most bytes an inbound stream may carry: two tokens plus one payload.
const MAX_INBOUND_STREAM: usize = MAX_MESSAGE_SIZE + 2 * MAX_TOKEN_LEN + 32;

pub struct Dispatcher {
    network: Arc<ExchangeNetwork>,
    content: ContentManager,
    engine: Engine,
    engine_enabled: bool,
    shutdown: CancellationToken,
    settings: ExchangeSettings,
}

impl Dispatcher {
    pub fn new(
        local: PeerId,
        store: Arc<dyn BlockStore>,
        transport: Arc<dyn Transport>,
        discovery: Arc<dyn ProviderDiscovery>,
        settings: &ExchangeSettings,
    ) -> Self {
        let network = Arc::new(ExchangeNetwork::new(
            local,
            transport,
            PeerBook::new(),
            settings.response_workers,
            settings.connect_timeout(),
            settings.response_timeout(),
        ));
        let quality = Arc::new(PeerQuality::new());
        let content = ContentManager::new(
            store.clone(),
            network.clone(),
            discovery,
            quality,
            settings,
        );
        let engine = Engine::new(store, network.clone(), settings);

        Self {
            network,
            content,
            engine,
            engine_enabled: settings.engine_enabled,
            shutdown: CancellationToken::new(),
            settings: settings.clone(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.network.local_peer()
    }

    pub fn settings(&self) -> &ExchangeSettings {
        &self.settings
    }

    pub fn quality(&self) -> &Arc<PeerQuality> {
        self.content.quality()
    }

    pub fn content(&self) -> &ContentManager {
        &self.content
    }

    pub fn peer_book(&self) -> &PeerBook {
        self.network.peer_book()
    }

    pub fn wants(&self) -> &WantTracker {
        self.engine.wants()
    }

    pub fn stats(&self) -> ProbeSnapshot {
        self.content.stats()
    }

    // ── Public surface ───────────────────────────────────────────────────────

    pub async fn get_block(
        &self,
        token: &CancellationToken,
        cid: ContentId,
        is_root: bool,
    ) -> Result<Block> {
        self.content.get_block(token, cid, is_root).await
    }

    pub fn preload(&self, token: &CancellationToken, cids: &[ContentId]) {
        self.content.load_blocks(token, cids);
    }

    pub fn reset(&self) {
        self.content.reset();
    }

    /// The one outbound primitive shared by both roles.
    pub async fn send_message(
        &self,
        token: &CancellationToken,
        peer: PeerId,
        message: &Message,
        priority: SendPriority,
    ) -> Result<()> {
        self.network.send_message(token, peer, message, priority).await
    }

    /// Route a decoded message to both roles.
    pub async fn receive_message(&self, peer: PeerId, message: Message) {
        tracing::trace!(
            peer = %peer.short(),
            wants = message.wantlist().len(),
            blocks = message.blocks().len(),
            haves = message.haves().len(),
            "message received"
        );

        for block in message.blocks() {
            // blocks we are waiting on are always taken
            if !self.content.is_fetching(block.cid()) && self.content.gate_peer(&peer) {
                tracing::debug!(
                    peer = %peer.short(),
                    cid = %block.cid().short(),
                    "unsolicited block from gated peer dropped"
                );
                continue;
            }
            self.content.block_received(peer, block);
        }

        let haves = message.haves();
        if !haves.is_empty() {
            self.content.have_received(peer, &haves);
        }

        if self.engine_enabled && !message.wantlist().is_empty() {
            self.engine
                .message_received(&self.shutdown, peer, &message)
                .await;
        }
    }

    /// Responder half of one stream: confirm the protocol tokens, then
    /// decode and route the payload.
    pub async fn handle_inbound_stream(&self, peer: PeerId, mut stream: BoxStream) -> Result<()> {
        let mut buf = Vec::new();
        let mut limited = (&mut stream).take(MAX_INBOUND_STREAM as u64);
        tokio::time::timeout(self.settings.response_timeout(), limited.read_to_end(&mut buf))
            .await
            .map_err(|_| ExchangeError::TimeoutIssue(format!("stream from {}", peer.short())))??;

        let frames = match wire::decode_frames(&buf) {
            Ok(frames) => frames,
            Err(e) => {
                refuse(&mut stream).await;
                return Err(e.into());
            }
        };

        let mut reply = Vec::new();
        let mut negotiated = 0;
        let mut payload = None;
        for frame in frames {
            match frame {
                Frame::Token(token) if negotiated == 0 && token == STREAM_PROTOCOL => {
                    reply.extend(wire::token_frame(STREAM_PROTOCOL));
                    negotiated = 1;
                }
                Frame::Token(token) if negotiated == 1 && token == EXCHANGE_PROTOCOL => {
                    reply.extend(wire::token_frame(EXCHANGE_PROTOCOL));
                    negotiated = 2;
                }
                Frame::Payload(body) if negotiated == 2 && payload.is_none() => {
                    payload = Some(body);
                }
                other => {
                    stream.write_all(&reply).await?;
                    refuse(&mut stream).await;
                    return Err(ExchangeError::ProtocolIssue(format!(
                        "unexpected {} from {}",
                        other.describe(),
                        peer.short()
                    )));
                }
            }
        }

        stream.write_all(&reply).await?;
        stream.shutdown().await?;

        if let Some(body) = payload {
            let message = Message::decode(&body)?;
            self.receive_message(peer, message).await;
        }
        Ok(())
    }

    /// Accept inbound streams until `shutdown` fires. Each stream gets its
    /// own task.
    pub async fn serve(self: Arc<Self>, mut inbound: InboundStreams, shutdown: CancellationToken) {
        loop {
            let (peer, stream) = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };
            let dispatcher = self.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.handle_inbound_stream(peer, stream).await {
                    tracing::debug!(peer = %peer.short(), error = %e, "inbound stream failed");
                }
            });
        }
        tracing::debug!(local = %self.local_peer().short(), "inbound loop stopped");
    }

    /// Stop engine responses in flight and drop cached connections.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.network.disconnect_all();
    }

    /// Log exchange counters and drop want records past their TTL.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let (priority, whitelisted) = self.quality().counts();
        tracing::info!(
            have_probes = stats.have_probes,
            want_blocks = stats.want_blocks,
            discovery_runs = stats.discovery_runs,
            blocks_received = stats.blocks_received,
            haves_received = stats.haves_received,
            pending = self.content.pending_fetches(),
            priority,
            whitelisted,
            known_peers = self.peer_book().len(),
            "exchange stats"
        );
        self.wants().prune(RECORD_TTL);
        self.wants().log_stats();
    }
}

async fn refuse(stream: &mut BoxStream) {
    let _ = stream.write_all(&wire::refusal_frame()).await;
    let _ = stream.shutdown().await;
}
