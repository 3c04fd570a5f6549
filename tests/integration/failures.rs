use crate::*;
use bitswarm_services::BlockStore;

// ══════════════════════════════════════════════════════════════════════════════
//  Cancellation & Peer Failures
// ══════════════════════════════════════════════════════════════════════════════

fn cancel_after(token: &CancellationToken, after: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        token.cancel();
    });
}

/// An already-cancelled request fails at once and sends nothing.
#[tokio::test]
async fn cancelled_request_sends_nothing() {
    let swarm = LoopbackSwarm::new();
    let a = spawn_node(&swarm, fast_settings());
    let b = spawn_node(&swarm, fast_settings());
    swarm.link(a.peer, b.peer);

    let block = block_of(10, 60);
    b.store.put(&block).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let result = a.dispatcher.get_block(&token, *block.cid(), false).await;
    assert!(matches!(result, Err(ExchangeError::Cancelled)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.dispatcher.stats().have_probes, 0);
    assert_eq!(b.dispatcher.wants().tracked_cids(), 0);
}

/// A block nobody has waits until the caller gives up.
#[tokio::test]
async fn missing_block_waits_for_cancel() {
    let swarm = LoopbackSwarm::new();
    let a = spawn_node(&swarm, fast_settings());
    let b = spawn_node(&swarm, fast_settings());
    swarm.link(a.peer, b.peer);

    let cid = *block_of(10, 61).cid();
    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(150));

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        a.dispatcher.get_block(&token, cid, false),
    )
    .await
    .expect("cancel not honoured");
    assert!(matches!(result, Err(ExchangeError::Cancelled)));
    assert_eq!(a.dispatcher.stats().have_probes, 1);
}

/// After a cancelled round the next request probes again and succeeds once
/// the block shows up.
#[tokio::test]
async fn retry_after_cancel_succeeds() {
    let swarm = LoopbackSwarm::new();
    let a = spawn_node(&swarm, fast_settings());
    let b = spawn_node(&swarm, fast_settings());
    swarm.link(a.peer, b.peer);

    let block = block_of(300, 62);
    let first = CancellationToken::new();
    cancel_after(&first, Duration::from_millis(100));
    let result = a.dispatcher.get_block(&first, *block.cid(), false).await;
    assert!(matches!(result, Err(ExchangeError::Cancelled)));
    assert!(a.dispatcher.content().is_fetching(block.cid()));

    b.store.put(&block).unwrap();
    let second = CancellationToken::new();
    let got = tokio::time::timeout(
        Duration::from_secs(5),
        a.dispatcher.get_block(&second, *block.cid(), false),
    )
    .await
    .expect("retry timed out")
    .unwrap();
    assert_eq!(got, block);
    assert_eq!(a.dispatcher.stats().have_probes, 2);
    assert!(!a.dispatcher.content().is_fetching(block.cid()));
}

/// A priority peer that cannot be reached is dropped from the priority set.
#[tokio::test]
async fn unreachable_priority_peer_demoted() {
    let swarm = LoopbackSwarm::new();
    let a = spawn_node(&swarm, fast_settings());
    let ghost = PeerId::random();
    a.dispatcher.quality().promote(ghost);

    let token = CancellationToken::new();
    cancel_after(&token, Duration::from_millis(200));
    let cid = *block_of(10, 63).cid();
    let _ = a.dispatcher.get_block(&token, cid, false).await;

    assert!(!a.dispatcher.quality().is_priority(&ghost));
    assert!(!a.dispatcher.quality().is_allowed(&ghost));
}

/// A peer that leaves mid-swarm stops being probed; the block still
/// comes from the node that stayed.
#[tokio::test]
async fn departed_peer_skipped() {
    let swarm = LoopbackSwarm::new();
    let a = spawn_node(&swarm, fast_settings());
    let gone = spawn_node(&swarm, fast_settings());
    let stays = spawn_node(&swarm, fast_settings());
    a.dispatcher.quality().promote(gone.peer);
    swarm.link(a.peer, stays.peer);
    swarm.leave(&gone.peer);

    let block = block_of(50, 64);
    stays.store.put(&block).unwrap();

    let token = CancellationToken::new();
    let got = tokio::time::timeout(
        Duration::from_secs(5),
        a.dispatcher.get_block(&token, *block.cid(), false),
    )
    .await
    .expect("get_block timed out")
    .unwrap();
    assert_eq!(got, block);
    assert!(
        wait_for(Duration::from_secs(2), || !a.dispatcher.quality().is_priority(&gone.peer)).await
    );
}

/// A WANT-BLOCK that cannot be delivered revokes the peer's whitelist entry.
#[tokio::test]
async fn failed_want_block_revokes_peer() {
    let swarm = LoopbackSwarm::new();
    let a = Arc::new(spawn_node(&swarm, fast_settings()));
    let ghost = PeerId::random();
    let cid = *block_of(4096, 65).cid();

    let token = CancellationToken::new();
    let fetching = {
        let node = a.clone();
        let token = token.clone();
        tokio::spawn(async move { node.dispatcher.get_block(&token, cid, false).await })
    };
    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.content().is_fetching(&cid)).await);

    let mut have = Message::new();
    have.add_have(cid);
    a.dispatcher.receive_message(ghost, have).await;

    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.stats().want_blocks == 1).await);
    assert!(wait_for(Duration::from_secs(2), || !a.dispatcher.quality().is_allowed(&ghost)).await);

    token.cancel();
    assert!(matches!(fetching.await.unwrap(), Err(ExchangeError::Cancelled)));
}

/// A peer refusing the protocol keeps its standing and the round moves on
/// to the next peer.
#[tokio::test]
async fn refused_want_block_moves_on() {
    let swarm = LoopbackSwarm::new();
    let a = Arc::new(spawn_node(&swarm, fast_settings()));
    let b = spawn_node(&swarm, fast_settings());
    let refuser = spawn_recorder(&swarm, true);

    let block = block_of(4096, 66);
    b.store.put(&block).unwrap();
    let cid = *block.cid();

    let token = CancellationToken::new();
    let fetching = {
        let node = a.clone();
        let token = token.clone();
        tokio::spawn(async move { node.dispatcher.get_block(&token, cid, false).await })
    };
    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.content().is_fetching(&cid)).await);

    let mut have = Message::new();
    have.add_have(cid);
    a.dispatcher.receive_message(refuser.peer, have).await;
    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.stats().want_blocks == 1).await);

    a.dispatcher.quality().promote(b.peer);
    let got = tokio::time::timeout(Duration::from_secs(5), fetching)
        .await
        .expect("get_block timed out")
        .unwrap()
        .unwrap();

    assert_eq!(got, block);
    assert_eq!(a.dispatcher.stats().want_blocks, 2);
    assert!(a.dispatcher.quality().is_allowed(&refuser.peer));
    assert!(a.store.has(&cid).unwrap());
}

/// A reset while a round is running does not strand it: the holder's later
/// HAVE is still taken and the block still delivered.
#[tokio::test]
async fn reset_mid_round_still_delivers() {
    let swarm = LoopbackSwarm::new();
    let a = Arc::new(spawn_node(&swarm, fast_settings()));
    let b = spawn_node(&swarm, fast_settings());
    swarm.link(a.peer, b.peer);

    let block = block_of(8 * 1024, 67);
    let cid = *block.cid();
    let token = CancellationToken::new();
    let fetching = {
        let node = a.clone();
        let token = token.clone();
        tokio::spawn(async move { node.dispatcher.get_block(&token, cid, false).await })
    };
    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.stats().have_probes == 1).await);

    a.dispatcher.reset();
    assert!(wait_for(Duration::from_secs(2), || a.dispatcher.content().is_fetching(&cid)).await);

    b.store.put(&block).unwrap();
    let mut have = Message::new();
    have.add_have(cid);
    b.dispatcher
        .send_message(&token, a.peer, &have, SendPriority::Urgent)
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_secs(5), fetching)
        .await
        .expect("get_block stranded after reset")
        .unwrap()
        .unwrap();
    assert_eq!(got, block);
    assert!(a.store.has(&cid).unwrap());
    assert!(a.dispatcher.stats().want_blocks >= 1);
    assert!(!a.dispatcher.content().is_fetching(&cid));
}
