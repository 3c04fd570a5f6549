//! Outbound sends and connection reuse.
//!
//! Every message travels on its own stream: the initiator writes both
//! protocol tokens and the framed payload, half-closes, then reads the
//! responder's token echo. A refusal or unexpected token is a protocol
//! issue; I/O failures become connection or timeout issues.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bitswarm_core::wire::{
    self, Frame, EXCHANGE_PROTOCOL, MAX_NEGOTIATION_REPLY, STREAM_PROTOCOL,
};
use bitswarm_core::{Message, PeerId};
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::{ExchangeError, Result};
use crate::peer::PeerBook;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Streams opened towards this node, tagged with the opener's identity.
pub type InboundStreams = tokio::sync::mpsc::Receiver<(PeerId, BoxStream)>;

/// An established link to one peer, able to open fresh streams.
#[async_trait]
pub trait Connection: Send + Sync {
    fn peer(&self) -> PeerId;

    async fn open_stream(&self) -> io::Result<BoxStream>;

    fn is_closed(&self) -> bool;
}

/// Reaches peers. Implemented by the loopback swarm and the daemon's TCP layer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, peer: PeerId, timeout: Duration) -> io::Result<Arc<dyn Connection>>;

    /// Peers currently reachable without discovery.
    fn connected_peers(&self) -> Vec<PeerId>;
}

/// How a send competes for resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPriority {
    /// Client probes. Never queued behind server responses.
    Urgent,
    /// Server responses. Bounded by the response pool.
    Normal,
}

pub struct ExchangeNetwork {
    local: PeerId,
    transport: Arc<dyn Transport>,
    connections: DashMap<PeerId, Arc<dyn Connection>>,
    book: PeerBook,
    response_permits: Semaphore,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl ExchangeNetwork {
    pub fn new(
        local: PeerId,
        transport: Arc<dyn Transport>,
        book: PeerBook,
        response_workers: usize,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            local,
            transport,
            connections: DashMap::new(),
            book,
            response_permits: Semaphore::new(response_workers.max(1)),
            connect_timeout,
            response_timeout,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.transport.connected_peers()
    }

    pub fn peer_book(&self) -> &PeerBook {
        &self.book
    }

    /// Send one message to `peer`, negotiating the exchange protocol first.
    pub async fn send_message(
        &self,
        token: &CancellationToken,
        peer: PeerId,
        message: &Message,
        priority: SendPriority,
    ) -> Result<()> {
        if token.is_cancelled() {
            return Err(ExchangeError::Cancelled);
        }
        let _permit = match priority {
            SendPriority::Urgent => None,
            SendPriority::Normal => tokio::select! {
                _ = token.cancelled() => return Err(ExchangeError::Cancelled),
                permit = self.response_permits.acquire() => Some(
                    permit.map_err(|_| ExchangeError::ConnectionIssue("network shut down".into()))?,
                ),
            },
        };

        let mut out = wire::token_frame(STREAM_PROTOCOL);
        out.extend(wire::token_frame(EXCHANGE_PROTOCOL));
        out.extend(wire::payload_frame(&message.encode()?)?);

        let start = Instant::now();
        let result = tokio::select! {
            _ = token.cancelled() => Err(ExchangeError::Cancelled),
            r = self.exchange(peer, &out) => r,
        };

        match &result {
            Ok(()) => {
                let took = start.elapsed();
                self.book.record_round_trip(peer, took);
                tracing::trace!(
                    peer = %peer.short(),
                    took_ms = took.as_millis() as u64,
                    "message sent"
                );
            }
            Err(e) if e.is_peer_fault() => {
                self.connections.remove(&peer);
                tracing::debug!(peer = %peer.short(), error = %e, "send failed");
            }
            Err(e) => tracing::debug!(peer = %peer.short(), error = %e, "send failed"),
        }
        result
    }

    async fn exchange(&self, peer: PeerId, out: &[u8]) -> Result<()> {
        let conn = self.connection(peer).await?;
        let mut stream = conn.open_stream().await?;

        let io = async {
            stream.write_all(out).await?;
            stream.shutdown().await?;
            let mut reply = Vec::new();
            (&mut stream)
                .take(MAX_NEGOTIATION_REPLY as u64)
                .read_to_end(&mut reply)
                .await?;
            Ok::<_, io::Error>(reply)
        };
        let reply = tokio::time::timeout(self.response_timeout, io)
            .await
            .map_err(|_| ExchangeError::TimeoutIssue(format!("no reply from {}", peer.short())))??;

        check_negotiation(&reply)
    }

    async fn connection(&self, peer: PeerId) -> Result<Arc<dyn Connection>> {
        if let Some(conn) = self.connections.get(&peer) {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
        }
        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.transport.connect(peer, self.connect_timeout),
        )
        .await
        .map_err(|_| ExchangeError::TimeoutIssue(format!("connect to {}", peer.short())))??;
        self.connections.insert(peer, conn.clone());
        Ok(conn)
    }

    /// Drop cached connections.
    pub fn disconnect_all(&self) {
        self.connections.clear();
    }
}

/// The reply must echo both tokens, in order.
fn check_negotiation(reply: &[u8]) -> Result<()> {
    let frames = wire::decode_frames(reply)
        .map_err(|e| ExchangeError::ProtocolIssue(format!("bad negotiation reply: {e}")))?;
    let mut tokens = frames.into_iter();
    for expected in [STREAM_PROTOCOL, EXCHANGE_PROTOCOL] {
        match tokens.next() {
            Some(Frame::Token(t)) if t == expected => {}
            Some(Frame::Refused) => {
                return Err(ExchangeError::ProtocolIssue(format!("{expected} refused")))
            }
            Some(other) => {
                return Err(ExchangeError::ProtocolIssue(format!(
                    "unexpected {} while negotiating {expected}",
                    other.describe()
                )))
            }
            None => {
                return Err(ExchangeError::ProtocolIssue(format!(
                    "stream closed before {expected} was confirmed"
                )))
            }
        }
    }
    Ok(())
}
