//! bitswarm integration test harness.
//!
//! Every test builds a small swarm of in-process nodes over the loopback
//! transport. Nodes stop their inbound loops when dropped.

use std::sync::Arc;
use std::time::Duration;

use bitswarm_core::config::ExchangeSettings;
use bitswarm_core::wire::{self, Frame};
use bitswarm_core::{Block, Codec, Message, PeerId};
use bitswarm_services::{
    Dispatcher, ExchangeError, ExchangeNetwork, LoopbackSwarm, MemoryBlockStore, NoDiscovery,
    PeerBook, ProviderDiscovery, SendPriority,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

mod concurrency;
mod discovery;
mod failures;
mod policy;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Short intervals so rounds settle quickly.
pub fn fast_settings() -> ExchangeSettings {
    ExchangeSettings {
        probe_interval_ms: 20,
        connect_timeout_ms: 1_000,
        response_timeout_ms: 2_000,
        ..ExchangeSettings::default()
    }
}

pub struct TestNode {
    pub peer: PeerId,
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<MemoryBlockStore>,
    stop: CancellationToken,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.stop.cancel();
        self.dispatcher.shutdown();
    }
}

pub fn spawn_node(swarm: &LoopbackSwarm, settings: ExchangeSettings) -> TestNode {
    spawn_node_with(swarm, settings, Arc::new(NoDiscovery))
}

pub fn spawn_node_with(
    swarm: &LoopbackSwarm,
    settings: ExchangeSettings,
    discovery: Arc<dyn ProviderDiscovery>,
) -> TestNode {
    let peer = PeerId::random();
    let (transport, inbound) = swarm.join(peer);
    let store = Arc::new(MemoryBlockStore::new());
    let dispatcher = Arc::new(Dispatcher::new(
        peer,
        store.clone(),
        Arc::new(transport),
        discovery,
        &settings,
    ));
    let stop = CancellationToken::new();
    tokio::spawn(dispatcher.clone().serve(inbound, stop.clone()));
    TestNode {
        peer,
        dispatcher,
        store,
        stop,
    }
}

/// A block of `len` bytes whose content depends on `seed`.
pub fn block_of(len: usize, seed: u8) -> Block {
    let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect();
    Block::new(Codec::Raw, data)
}

/// Poll `condition` until it holds or `limit` passes.
pub async fn wait_for(limit: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// A bare peer that records every message sent to it and never answers
/// wants. With `refuse` set it rejects the exchange protocol instead.
pub struct Recorder {
    pub peer: PeerId,
    network: ExchangeNetwork,
    received: Arc<Mutex<Vec<Message>>>,
    stop: CancellationToken,
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

pub fn spawn_recorder(swarm: &LoopbackSwarm, refuse: bool) -> Recorder {
    let peer = PeerId::random();
    let (transport, mut inbound) = swarm.join(peer);
    let network = ExchangeNetwork::new(
        peer,
        Arc::new(transport),
        PeerBook::new(),
        8,
        Duration::from_secs(1),
        Duration::from_secs(2),
    );
    let received = Arc::new(Mutex::new(Vec::new()));
    let stop = CancellationToken::new();

    let sink = received.clone();
    let token = stop.clone();
    tokio::spawn(async move {
        loop {
            let (_from, mut stream) = tokio::select! {
                _ = token.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if stream.read_to_end(&mut buf).await.is_err() {
                    return;
                }
                let Ok(frames) = wire::decode_frames(&buf) else {
                    return;
                };
                let mut reply = Vec::new();
                let mut payload = None;
                for frame in frames {
                    match frame {
                        Frame::Token(t) if refuse && t != wire::STREAM_PROTOCOL => {
                            reply.extend(wire::refusal_frame());
                            break;
                        }
                        Frame::Token(t) => reply.extend(wire::token_frame(&t)),
                        Frame::Payload(body) => payload = Some(body),
                        Frame::Refused => {}
                    }
                }
                let _ = stream.write_all(&reply).await;
                let _ = stream.shutdown().await;
                if refuse {
                    return;
                }
                if let Some(message) = payload.and_then(|body| Message::decode(&body).ok()) {
                    sink.lock().push(message);
                }
            });
        }
    });

    Recorder {
        peer,
        network,
        received,
        stop,
    }
}

impl Recorder {
    pub async fn send(&self, to: PeerId, message: &Message) -> Result<(), ExchangeError> {
        self.network
            .send_message(&CancellationToken::new(), to, message, SendPriority::Urgent)
            .await
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().clone()
    }

    /// Wait for the first recorded message.
    pub async fn next_message(&self, limit: Duration) -> Option<Message> {
        wait_for(limit, || !self.received.lock().is_empty()).await;
        self.received.lock().first().cloned()
    }
}
