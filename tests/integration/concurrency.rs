use crate::*;
use bitswarm_core::WantType;
use bitswarm_services::BlockStore;

// ══════════════════════════════════════════════════════════════════════════════
//  Concurrent Requests
// ══════════════════════════════════════════════════════════════════════════════

/// Many callers for one CID share a single round: each peer is probed once
/// and every caller receives the same block.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_share_one_round() {
    let swarm = LoopbackSwarm::new();
    let a = Arc::new(spawn_node(&swarm, fast_settings()));
    let b = spawn_node(&swarm, fast_settings());
    let c = spawn_node(&swarm, fast_settings());
    swarm.link(a.peer, b.peer);
    swarm.link(a.peer, c.peer);

    let block = block_of(900, 11);
    b.store.put(&block).unwrap();
    let cid = *block.cid();

    let token = CancellationToken::new();
    let mut callers = Vec::new();
    for _ in 0..8 {
        let node = a.clone();
        let token = token.clone();
        callers.push(tokio::spawn(async move {
            node.dispatcher.get_block(&token, cid, false).await
        }));
    }

    for caller in callers {
        let got = tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .expect("caller timed out")
            .unwrap()
            .unwrap();
        assert_eq!(got, block);
    }

    assert_eq!(a.dispatcher.stats().have_probes, 2);
    assert_eq!(b.dispatcher.wants().wanted_by(&cid), vec![a.peer]);
    assert_eq!(a.dispatcher.content().pending_fetches(), 0);
}

/// Requests for different CIDs run side by side.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_cids_fetch_in_parallel() {
    let swarm = LoopbackSwarm::new();
    let a = Arc::new(spawn_node(&swarm, fast_settings()));
    let b = spawn_node(&swarm, fast_settings());
    swarm.link(a.peer, b.peer);

    let blocks: Vec<Block> = (0..6u8)
        .map(|i| block_of(2048 * (i as usize + 1), 20 + i))
        .collect();
    for block in &blocks {
        b.store.put(block).unwrap();
    }

    let token = CancellationToken::new();
    let mut callers = Vec::new();
    for block in &blocks {
        let node = a.clone();
        let token = token.clone();
        let cid = *block.cid();
        callers.push(tokio::spawn(async move {
            node.dispatcher.get_block(&token, cid, false).await
        }));
    }
    for caller in callers {
        tokio::time::timeout(Duration::from_secs(5), caller)
            .await
            .expect("caller timed out")
            .unwrap()
            .unwrap();
    }

    for block in &blocks {
        assert!(a.store.has(block.cid()).unwrap());
    }
    assert_eq!(a.dispatcher.stats().want_blocks, blocks.len() as u64);
}

/// A HAVE arriving twice from the same peer yields one WANT-BLOCK.
#[tokio::test]
async fn repeated_have_asks_once() {
    let swarm = LoopbackSwarm::new();
    let a = Arc::new(spawn_node(&swarm, fast_settings()));
    let recorder = spawn_recorder(&swarm, false);

    let cid = *block_of(4096, 30).cid();
    let token = CancellationToken::new();
    let fetching = {
        let node = a.clone();
        let token = token.clone();
        tokio::spawn(async move { node.dispatcher.get_block(&token, cid, false).await })
    };
    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.content().is_fetching(&cid)).await);

    let mut have = Message::new();
    have.add_have(cid);
    recorder.send(a.peer, &have).await.unwrap();
    recorder.send(a.peer, &have).await.unwrap();

    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.stats().haves_received == 2).await);
    let block_wants = || {
        recorder
            .received()
            .iter()
            .filter(|m| m.wantlist().iter().any(|e| e.want_type == WantType::Block))
            .count()
    };
    assert!(wait_for(Duration::from_secs(2), || block_wants() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(block_wants(), 1);
    assert_eq!(a.dispatcher.stats().want_blocks, 1);

    token.cancel();
    let result = fetching.await.unwrap();
    assert!(matches!(result, Err(ExchangeError::Cancelled)));
}
