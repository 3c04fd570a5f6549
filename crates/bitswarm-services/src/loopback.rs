//! In-process transport, so several nodes can share one runtime.
//!
//! Each node joins the swarm and receives an [`InboundStreams`] channel. A
//! stream opened towards a node is one half of a `tokio::io::duplex` pair;
//! the other half lands on that node's channel tagged with the opener's id.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitswarm_core::PeerId;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::network::{BoxStream, Connection, InboundStreams, Transport};

const DUPLEX_BUFFER: usize = 64 * 1024;
const INBOUND_BACKLOG: usize = 128;

#[derive(Default)]
struct SwarmState {
    nodes: HashMap<PeerId, mpsc::Sender<(PeerId, BoxStream)>>,
    links: HashMap<PeerId, BTreeSet<PeerId>>,
}

#[derive(Clone, Default)]
pub struct LoopbackSwarm {
    state: Arc<RwLock<SwarmState>>,
}

impl LoopbackSwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer`. Replaces any earlier registration.
    pub fn join(&self, peer: PeerId) -> (LoopbackTransport, InboundStreams) {
        let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
        self.state.write().nodes.insert(peer, tx);
        let transport = LoopbackTransport {
            local: peer,
            swarm: self.clone(),
        };
        (transport, rx)
    }

    /// Take `peer` off the swarm. Later connects and streams fail.
    pub fn leave(&self, peer: &PeerId) {
        let mut state = self.state.write();
        state.nodes.remove(peer);
        state.links.remove(peer);
        for linked in state.links.values_mut() {
            linked.remove(peer);
        }
    }

    /// Mark two nodes as connected, so each shows up in the other's
    /// connected peer list.
    pub fn link(&self, a: PeerId, b: PeerId) {
        let mut state = self.state.write();
        state.links.entry(a).or_default().insert(b);
        state.links.entry(b).or_default().insert(a);
    }

    fn sender(&self, peer: &PeerId) -> Option<mpsc::Sender<(PeerId, BoxStream)>> {
        self.state.read().nodes.get(peer).cloned()
    }

    fn linked(&self, peer: &PeerId) -> Vec<PeerId> {
        self.state
            .read()
            .links
            .get(peer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

pub struct LoopbackTransport {
    local: PeerId,
    swarm: LoopbackSwarm,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, peer: PeerId, _timeout: Duration) -> io::Result<Arc<dyn Connection>> {
        if self.swarm.sender(&peer).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} is not on the swarm", peer.short()),
            ));
        }
        Ok(Arc::new(LoopbackConnection {
            local: self.local,
            remote: peer,
            swarm: self.swarm.clone(),
        }))
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.swarm.linked(&self.local)
    }
}

struct LoopbackConnection {
    local: PeerId,
    remote: PeerId,
    swarm: LoopbackSwarm,
}

#[async_trait]
impl Connection for LoopbackConnection {
    fn peer(&self) -> PeerId {
        self.remote
    }

    async fn open_stream(&self) -> io::Result<BoxStream> {
        let sender = self
            .swarm
            .sender(&self.remote)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
        sender
            .send((self.local, Box::new(theirs) as BoxStream))
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionReset))?;
        Ok(Box::new(ours))
    }

    fn is_closed(&self) -> bool {
        self.swarm.sender(&self.remote).is_none()
    }
}
