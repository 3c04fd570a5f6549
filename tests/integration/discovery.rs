use crate::*;
use bitswarm_services::{BlockStore, StaticProviders};

// ══════════════════════════════════════════════════════════════════════════════
//  Provider Discovery
// ══════════════════════════════════════════════════════════════════════════════

/// A root request searches for providers before any peer is known.
#[tokio::test]
async fn root_request_finds_provider() {
    let swarm = LoopbackSwarm::new();
    let holder = spawn_node(&swarm, fast_settings());
    let a = spawn_node_with(
        &swarm,
        fast_settings(),
        Arc::new(StaticProviders::new(vec![holder.peer])),
    );

    let block = block_of(2000, 70);
    holder.store.put(&block).unwrap();

    let token = CancellationToken::new();
    let got = tokio::time::timeout(
        Duration::from_secs(5),
        a.dispatcher.get_block(&token, *block.cid(), true),
    )
    .await
    .expect("get_block timed out")
    .unwrap();

    assert_eq!(got, block);
    assert_eq!(a.dispatcher.stats().discovery_runs, 1);
    assert!(a.dispatcher.quality().is_priority(&holder.peer));
}

/// Non-root requests only search once the refresh interval has passed.
#[tokio::test]
async fn stalled_request_refreshes_discovery() {
    let swarm = LoopbackSwarm::new();
    let holder = spawn_node(&swarm, fast_settings());
    let settings = ExchangeSettings {
        provider_refresh_ms: 100,
        ..fast_settings()
    };
    let a = spawn_node_with(
        &swarm,
        settings,
        Arc::new(StaticProviders::new(vec![holder.peer])),
    );

    let block = block_of(20, 71);
    holder.store.put(&block).unwrap();

    let token = CancellationToken::new();
    let got = tokio::time::timeout(
        Duration::from_secs(5),
        a.dispatcher.get_block(&token, *block.cid(), false),
    )
    .await
    .expect("get_block timed out")
    .unwrap();

    assert_eq!(got, block);
    assert!(a.dispatcher.stats().discovery_runs >= 1);
    assert!(a.store.has(block.cid()).unwrap());
}

/// Without peers or providers the request just waits.
#[tokio::test]
async fn no_providers_no_progress() {
    let swarm = LoopbackSwarm::new();
    let a = spawn_node(&swarm, fast_settings());

    let token = CancellationToken::new();
    let stop = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop.cancel();
    });

    let cid = *block_of(20, 72).cid();
    let result = a.dispatcher.get_block(&token, cid, true).await;
    assert!(matches!(result, Err(ExchangeError::Cancelled)));

    let stats = a.dispatcher.stats();
    assert_eq!(stats.discovery_runs, 1);
    assert_eq!(stats.have_probes, 0);
}
