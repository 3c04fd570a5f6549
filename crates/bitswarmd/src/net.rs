//! TCP transport. One TCP connection per stream, each opened with a
//! [`StreamPreface`] naming the caller and the port it listens on.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use zerocopy::AsBytes;

use bitswarm_core::wire::{StreamPreface, PREFACE_LEN};
use bitswarm_core::PeerId;
use bitswarm_services::{BoxStream, Connection, Transport};

const PREFACE_TIMEOUT: Duration = Duration::from_secs(5);

/// Known peer addresses, from config and from inbound prefaces.
pub type AddressBook = Arc<DashMap<PeerId, SocketAddr>>;

/// Parse `<peer-id-hex>@<host:port>` entries. Bad entries are logged and skipped.
pub fn parse_bootstrap(entries: &[String]) -> Vec<(PeerId, SocketAddr)> {
    let mut peers = Vec::new();
    for entry in entries {
        let parsed = entry.split_once('@').and_then(|(id, addr)| {
            let peer = id.parse::<PeerId>().ok()?;
            let addr = addr.parse::<SocketAddr>().ok()?;
            Some((peer, addr))
        });
        match parsed {
            Some(p) => peers.push(p),
            None => tracing::warn!(entry = %entry, "ignoring malformed bootstrap peer"),
        }
    }
    peers
}

pub struct TcpTransport {
    local: PeerId,
    listen_port: u16,
    addrs: AddressBook,
}

impl TcpTransport {
    pub fn new(local: PeerId, listen_port: u16, addrs: AddressBook) -> Self {
        Self {
            local,
            listen_port,
            addrs,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, peer: PeerId, _timeout: Duration) -> io::Result<Arc<dyn Connection>> {
        let addr = self.addrs.get(&peer).map(|a| *a).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {}", peer.short()),
            )
        })?;
        Ok(Arc::new(TcpConnection {
            preface: StreamPreface::new(*self.local.as_bytes(), self.listen_port),
            peer,
            addr,
            failed: AtomicBool::new(false),
        }))
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.addrs.iter().map(|e| *e.key()).collect()
    }
}

struct TcpConnection {
    preface: StreamPreface,
    peer: PeerId,
    addr: SocketAddr,
    failed: AtomicBool,
}

#[async_trait]
impl Connection for TcpConnection {
    fn peer(&self) -> PeerId {
        self.peer
    }

    async fn open_stream(&self) -> io::Result<BoxStream> {
        let opened = async {
            let mut stream = TcpStream::connect(self.addr).await?;
            stream.set_nodelay(true)?;
            stream.write_all(self.preface.as_bytes()).await?;
            Ok::<_, io::Error>(stream)
        }
        .await;
        match opened {
            Ok(stream) => Ok(Box::new(stream)),
            Err(e) => {
                self.failed.store(true, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Accepts TCP streams, reads the preface, and hands them to the dispatcher.
pub struct StreamListener {
    listener: TcpListener,
    addrs: AddressBook,
    inbound: mpsc::Sender<(PeerId, BoxStream)>,
    shutdown: broadcast::Receiver<()>,
}

impl StreamListener {
    pub fn new(
        listener: TcpListener,
        addrs: AddressBook,
        inbound: mpsc::Sender<(PeerId, BoxStream)>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            addrs,
            inbound,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("stream listener shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let addrs = self.addrs.clone();
                    let inbound = self.inbound.clone();
                    tokio::spawn(async move {
                        if let Err(e) = admit(stream, remote, addrs, inbound).await {
                            tracing::debug!(remote = %remote, error = %e, "inbound stream rejected");
                        }
                    });
                }
            }
        }
    }
}

/// Record `addr` for `peer` unless an address is already known. The
/// preface is unauthenticated, so a known address is never replaced.
fn learn_address(addrs: &AddressBook, peer: PeerId, addr: SocketAddr) -> bool {
    match addrs.entry(peer) {
        Entry::Vacant(slot) => {
            slot.insert(addr);
            tracing::info!(peer = %peer.short(), addr = %addr, "learned peer address");
            true
        }
        Entry::Occupied(known) => {
            if *known.get() != addr {
                tracing::warn!(
                    peer = %peer.short(),
                    known = %known.get(),
                    claimed = %addr,
                    "ignoring conflicting peer address"
                );
            }
            false
        }
    }
}

async fn admit(
    mut stream: TcpStream,
    remote: SocketAddr,
    addrs: AddressBook,
    inbound: mpsc::Sender<(PeerId, BoxStream)>,
) -> Result<()> {
    let mut buf = [0u8; PREFACE_LEN];
    tokio::time::timeout(PREFACE_TIMEOUT, stream.read_exact(&mut buf)).await??;
    let preface = StreamPreface::parse(&buf)?;
    let peer = PeerId::from_bytes(preface.peer_id);

    let port = preface.listen_port();
    if port != 0 {
        learn_address(&addrs, peer, SocketAddr::new(remote.ip(), port));
    }

    inbound
        .send((peer, Box::new(stream) as BoxStream))
        .await
        .map_err(|_| anyhow::anyhow!("dispatcher stopped"))?;
    Ok(())
}
