use crate::*;
use bitswarm_core::WantType;
use bitswarm_services::BlockStore;

// ══════════════════════════════════════════════════════════════════════════════
//  Responder Policy
// ══════════════════════════════════════════════════════════════════════════════

const QUIET: Duration = Duration::from_millis(200);

#[tokio::test]
async fn want_have_at_threshold_returns_block() {
    let swarm = LoopbackSwarm::new();
    let server = spawn_node(&swarm, fast_settings());
    let recorder = spawn_recorder(&swarm, false);

    let block = block_of(1024, 40);
    server.store.put(&block).unwrap();

    recorder
        .send(server.peer, &Message::want_haves(&[*block.cid()]))
        .await
        .unwrap();
    let reply = recorder
        .next_message(Duration::from_secs(2))
        .await
        .expect("no reply");
    assert_eq!(reply.blocks(), &[block]);
    assert!(reply.haves().is_empty());
}

#[tokio::test]
async fn want_have_above_threshold_returns_have() {
    let swarm = LoopbackSwarm::new();
    let server = spawn_node(&swarm, fast_settings());
    let recorder = spawn_recorder(&swarm, false);

    let block = block_of(1025, 41);
    server.store.put(&block).unwrap();

    recorder
        .send(server.peer, &Message::want_haves(&[*block.cid()]))
        .await
        .unwrap();
    let reply = recorder
        .next_message(Duration::from_secs(2))
        .await
        .expect("no reply");
    assert!(reply.blocks().is_empty());
    assert_eq!(reply.haves(), vec![*block.cid()]);
}

/// One request mixing found and missing entries gets one combined reply.
#[tokio::test]
async fn mixed_wants_answered_in_one_message() {
    let swarm = LoopbackSwarm::new();
    let settings = ExchangeSettings {
        send_dont_haves: true,
        ..fast_settings()
    };
    let server = spawn_node(&swarm, settings);
    let recorder = spawn_recorder(&swarm, false);

    let small = block_of(16, 42);
    let large = block_of(4096, 43);
    let missing = *block_of(16, 44).cid();
    server.store.put(&small).unwrap();
    server.store.put(&large).unwrap();

    let mut request = Message::want_haves(&[*small.cid(), *large.cid()]);
    request.add_entry(missing, 1, WantType::Block, true);
    recorder.send(server.peer, &request).await.unwrap();

    let reply = recorder
        .next_message(Duration::from_secs(2))
        .await
        .expect("no reply");
    assert_eq!(reply.blocks(), &[small]);
    assert_eq!(reply.haves(), vec![*large.cid()]);
    assert_eq!(reply.dont_haves(), vec![missing]);
    assert_eq!(reply.pending_bytes(), 0);

    tokio::time::sleep(QUIET).await;
    assert_eq!(recorder.received().len(), 1);
}

#[tokio::test]
async fn dont_have_sent_when_enabled_and_asked() {
    let swarm = LoopbackSwarm::new();
    let settings = ExchangeSettings {
        send_dont_haves: true,
        ..fast_settings()
    };
    let server = spawn_node(&swarm, settings);
    let recorder = spawn_recorder(&swarm, false);
    let missing = *block_of(64, 45).cid();

    recorder
        .send(server.peer, &Message::want_blocks(&[missing]))
        .await
        .unwrap();
    let reply = recorder
        .next_message(Duration::from_secs(2))
        .await
        .expect("no reply");
    assert_eq!(reply.dont_haves(), vec![missing]);
}

#[tokio::test]
async fn dont_have_needs_entry_flag() {
    let swarm = LoopbackSwarm::new();
    let settings = ExchangeSettings {
        send_dont_haves: true,
        ..fast_settings()
    };
    let server = spawn_node(&swarm, settings);
    let recorder = spawn_recorder(&swarm, false);
    let missing = *block_of(64, 46).cid();

    let mut request = Message::new();
    request.add_entry(missing, 1, WantType::Block, false);
    recorder.send(server.peer, &request).await.unwrap();

    tokio::time::sleep(QUIET).await;
    assert!(recorder.received().is_empty());
    assert_eq!(server.dispatcher.wants().want_count(&missing), 1);
}

#[tokio::test]
async fn dont_have_suppressed_by_default() {
    let swarm = LoopbackSwarm::new();
    let server = spawn_node(&swarm, fast_settings());
    let recorder = spawn_recorder(&swarm, false);
    let missing = *block_of(64, 47).cid();

    recorder
        .send(server.peer, &Message::want_blocks(&[missing]))
        .await
        .unwrap();

    tokio::time::sleep(QUIET).await;
    assert!(recorder.received().is_empty());
}

/// A node with the engine off still fetches but never answers wants.
#[tokio::test]
async fn disabled_engine_stays_silent() {
    let swarm = LoopbackSwarm::new();
    let settings = ExchangeSettings {
        engine_enabled: false,
        ..fast_settings()
    };
    let server = spawn_node(&swarm, settings);
    let recorder = spawn_recorder(&swarm, false);

    let block = block_of(10, 48);
    server.store.put(&block).unwrap();
    recorder
        .send(server.peer, &Message::want_blocks(&[*block.cid()]))
        .await
        .unwrap();

    tokio::time::sleep(QUIET).await;
    assert!(recorder.received().is_empty());
    assert_eq!(server.dispatcher.wants().tracked_cids(), 0);
}

/// Cancels clear the responder's record of the want.
#[tokio::test]
async fn cancel_clears_want_record() {
    let swarm = LoopbackSwarm::new();
    let server = spawn_node(&swarm, fast_settings());
    let recorder = spawn_recorder(&swarm, false);
    let missing = *block_of(64, 49).cid();

    recorder
        .send(server.peer, &Message::want_haves(&[missing]))
        .await
        .unwrap();
    let wants = server.dispatcher.wants();
    assert!(wait_for(Duration::from_secs(2), || wants.want_count(&missing) == 1).await);

    let mut cancel = Message::new();
    cancel.cancel(missing);
    recorder.send(server.peer, &cancel).await.unwrap();
    assert!(wait_for(Duration::from_secs(2), || wants.want_count(&missing) == 0).await);
    assert!(!server.store.has(&missing).unwrap());
}
