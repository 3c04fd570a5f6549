//! bitswarm-services — the block exchange: stores, peer quality, the
//! content manager (client), the engine (server), and the dispatcher that
//! joins them over a transport.

pub mod blocker;
pub mod content_manager;
pub mod discovery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod fs_store;
pub mod loopback;
pub mod network;
pub mod peer;
pub mod quality;
pub mod store;
pub mod wants;

pub use blocker::{Blocker, CidLocks};
pub use content_manager::{ContentManager, ProbeSnapshot, ProbeStats};
pub use discovery::{NoDiscovery, ProviderDiscovery, StaticProviders};
pub use dispatch::Dispatcher;
pub use engine::Engine;
pub use error::ExchangeError;
pub use fetch::PendingFetch;
pub use fs_store::FsBlockStore;
pub use loopback::{LoopbackSwarm, LoopbackTransport};
pub use network::{
    AsyncStream, BoxStream, Connection, ExchangeNetwork, InboundStreams, SendPriority, Transport,
};
pub use peer::{PeerBook, PeerStats};
pub use quality::PeerQuality;
pub use store::{BlockStore, MemoryBlockStore};
pub use wants::WantTracker;
