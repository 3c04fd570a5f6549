//! bitswarmd — block exchange node.
//!
//! Usage:
//!   bitswarmd [serve]
//!   bitswarmd add <file> [--codec raw|dag-pb|dag-cbor]
//!   bitswarmd get <cid> [--out <file>] [--timeout <secs>]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use bitswarm_core::config::{BitswarmConfig, StorageConfig};
use bitswarm_core::wire::MAX_BLOCK_SIZE;
use bitswarm_core::{Block, Codec, ContentId};
use bitswarm_services::{
    BlockStore, Dispatcher, FsBlockStore, MemoryBlockStore, StaticProviders,
};

mod identity;
mod net;

use net::{AddressBook, StreamListener, TcpTransport};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
enum Command {
    Serve,
    Add { path: PathBuf, codec: Codec },
    Get {
        cid: ContentId,
        out: Option<PathBuf>,
        timeout: Option<Duration>,
    },
}

fn parse_codec(name: &str) -> Result<Codec> {
    match name {
        "raw" => Ok(Codec::Raw),
        "dag-pb" => Ok(Codec::DagProtobuf),
        "dag-cbor" => Ok(Codec::DagCbor),
        other => bail!("unknown codec {other}"),
    }
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut args = args.iter();
    match args.next().map(String::as_str) {
        None | Some("serve") => Ok(Command::Serve),
        Some("add") => {
            let path = args.next().context("add needs a file")?;
            let mut codec = Codec::Raw;
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--codec" => codec = parse_codec(args.next().context("--codec needs a value")?)?,
                    other => bail!("unexpected argument {other}"),
                }
            }
            Ok(Command::Add {
                path: PathBuf::from(path),
                codec,
            })
        }
        Some("get") => {
            let cid = args
                .next()
                .context("get needs a cid")?
                .parse::<ContentId>()
                .context("malformed cid")?;
            let mut out = None;
            let mut timeout = None;
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--out" => out = Some(PathBuf::from(args.next().context("--out needs a path")?)),
                    "--timeout" => {
                        let secs: u64 = args
                            .next()
                            .context("--timeout needs seconds")?
                            .parse()
                            .context("--timeout needs seconds")?;
                        timeout = Some(Duration::from_secs(secs));
                    }
                    other => bail!("unexpected argument {other}"),
                }
            }
            Ok(Command::Get { cid, out, timeout })
        }
        Some(other) => bail!("unknown command {other}"),
    }
}

fn open_store(storage: &StorageConfig) -> Result<Arc<dyn BlockStore>> {
    if storage.in_memory {
        tracing::info!("using in-memory block store");
        return Ok(Arc::new(MemoryBlockStore::new()));
    }
    let store = FsBlockStore::new(&storage.blocks_path)?;
    tracing::info!(
        root = %storage.blocks_path.display(),
        blocks = store.count(),
        bytes = store.total_bytes(),
        "block store ready"
    );
    Ok(Arc::new(store))
}

/// Split a file into blocks, store them, and print their CIDs.
fn add(store: &dyn BlockStore, path: &Path, codec: Codec) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if data.is_empty() {
        let block = Block::new(codec, Vec::new());
        store.put(&block)?;
        println!("{}", block.cid());
        return Ok(());
    }
    for chunk in data.chunks(MAX_BLOCK_SIZE) {
        let block = Block::new(codec, chunk.to_vec());
        store.put(&block)?;
        println!("{}", block.cid());
    }
    Ok(())
}

struct Node {
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
    serve_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    async fn start(config: &BitswarmConfig, store: Arc<dyn BlockStore>) -> Result<Self> {
        let local = identity::load_or_create(&config.identity.peer_id_path)?;
        let listener = TcpListener::bind(&config.network.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
        let listen_addr = listener.local_addr()?;
        tracing::info!(peer = %local, addr = %listen_addr, "bitswarmd starting");

        let addrs: AddressBook = Arc::new(DashMap::new());
        let bootstrap = net::parse_bootstrap(&config.network.bootstrap_peers);
        for (peer, addr) in &bootstrap {
            addrs.insert(*peer, *addr);
        }
        let providers = StaticProviders::new(bootstrap.iter().map(|(peer, _)| *peer).collect());

        let transport = Arc::new(TcpTransport::new(local, listen_addr.port(), addrs.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            local,
            store,
            transport,
            Arc::new(providers),
            &config.exchange,
        ));
        dispatcher
            .quality()
            .apply_config(&config.trust.trusted_peers);
        tracing::info!(
            engine = config.exchange.engine_enabled,
            send_dont_haves = config.exchange.send_dont_haves,
            bootstrap = bootstrap.len(),
            "exchange configured"
        );

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let serve_token = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let listener_task = {
            let listener = StreamListener::new(listener, addrs, inbound_tx, shutdown_tx.subscribe());
            tokio::spawn(async move {
                if let Err(e) = listener.run().await {
                    tracing::error!(error = %e, "stream listener failed");
                }
            })
        };

        let serve_task = tokio::spawn(dispatcher.clone().serve(inbound_rx, serve_token.clone()));

        let stats_task = {
            let dispatcher = dispatcher.clone();
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(STATS_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = interval.tick() => dispatcher.log_stats(),
                    }
                }
            })
        };

        Ok(Self {
            dispatcher,
            shutdown_tx,
            serve_token,
            tasks: vec![listener_task, serve_task, stats_task],
        })
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.serve_token.cancel();
        self.dispatcher.shutdown();
        for task in self.tasks {
            let _ = task.await;
        }
        tracing::info!("bitswarmd stopped");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = BitswarmConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BitswarmConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BitswarmConfig::default()
    });

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    let store = open_store(&config.storage)?;

    match command {
        Command::Add { path, codec } => add(store.as_ref(), &path, codec),
        Command::Serve => {
            let node = Node::start(&config, store).await?;
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            node.stop().await;
            Ok(())
        }
        Command::Get { cid, out, timeout } => {
            let node = Node::start(&config, store).await?;
            let token = CancellationToken::new();
            if let Some(limit) = timeout {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    token.cancel();
                });
            }
            {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::signal::ctrl_c().await.ok();
                    token.cancel();
                });
            }

            let result = node.dispatcher.get_block(&token, cid, true).await;
            node.stop().await;
            let block = result.with_context(|| format!("failed to fetch {}", cid.short()))?;
            match out {
                Some(path) => std::fs::write(&path, block.data())
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(block.data())?;
                }
            }
            Ok(())
        }
    }
}
