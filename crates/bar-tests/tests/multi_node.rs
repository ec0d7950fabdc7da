//! Multi-node tests over the in-memory hub.
//!
//! Each test starts real `BarNode`s with their dispatcher and background
//! tasks and observes the admission state they converge to.

use std::time::Duration;

use bar_core::traits::{ChainState, TransportEvent};
use bar_core::types::{PeerId, PeerStatus, unix_now};
use bar_network::{InactivityKind, InactivityMessage, MemoryHub, PushKind, PushMessage, PUSH_TOPIC, WireMessage};
use bar_tests::helpers::{RawPeer, TestNode, fast_config, wait_until};

const WAIT: Duration = Duration::from_secs(5);

fn status(node: &TestNode, peer: &str) -> Option<PeerStatus> {
    node.node.peer_status(&PeerId::from(peer))
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_promotes_both_sides() {
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, "a", fast_config());
    let b = TestNode::spawn(&hub, "b", fast_config());

    a.connect("b");

    assert!(
        wait_until(WAIT, || {
            status(&a, "b") == Some(PeerStatus::Whitelisted) && status(&b, "a") == Some(PeerStatus::Whitelisted)
        })
        .await,
        "handshake did not complete: a sees b as {:?}, b sees a as {:?}",
        status(&a, "b"),
        status(&b, "a")
    );
    assert_eq!(a.node.controller().peer(&b.id).unwrap().misbehavior_score, 0);
    assert!(a.node.controller().peer(&b.id).unwrap().last_handshake.is_some());

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn different_networks_never_promote() {
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, "a", fast_config());
    let mut other = fast_config();
    other.network.network_id = "bar-elsewhere".to_string();
    let b = TestNode::spawn(&hub, "b", other);

    a.connect("b");

    // Each side scores the other's ping as carrying an invalid seed.
    assert!(
        wait_until(WAIT, || {
            a.node.controller().peer(&b.id).is_some_and(|p| p.misbehavior_score > 0)
                && b.node.controller().peer(&a.id).is_some_and(|p| p.misbehavior_score > 0)
        })
        .await
    );
    assert_eq!(status(&a, "b"), Some(PeerStatus::Greylisted));
    assert_eq!(status(&b, "a"), Some(PeerStatus::Greylisted));

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_whitelist_defers_promotion_until_slot_frees() {
    let hub = MemoryHub::new();
    let mut config = fast_config();
    config.network.policy.whitelist_capacity = 1;
    let a = TestNode::spawn(&hub, "a", config);
    let b = TestNode::spawn(&hub, "b", fast_config());
    let c = TestNode::spawn(&hub, "c", fast_config());

    b.connect("a");
    c.connect("a");

    // Both handshakes complete in both directions; only one peer fits.
    assert!(
        wait_until(WAIT, || {
            a.node.controller().whitelisted().len() == 1
                && a.node.handshake().deferred_peers().len() == 1
                && a.node.handshake().pending_count() == 0
        })
        .await
    );
    let winner = a.node.controller().whitelisted()[0].clone();
    let waiting = a.node.handshake().deferred_peers()[0].clone();
    assert_ne!(winner, waiting);
    assert_eq!(a.node.peer_status(&waiting), Some(PeerStatus::Greylisted));

    a.node.controller().demote(&winner);

    assert!(wait_until(WAIT, || a.node.peer_status(&waiting) == Some(PeerStatus::Whitelisted)).await);
    assert!(a.node.handshake().deferred_peers().is_empty());

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

// ---------------------------------------------------------------------------
// Optimistic push
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn promotion_pulls_tip_block_from_peer() {
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, "a", fast_config());
    let b = TestNode::spawn(&hub, "b", fast_config());
    let tip = b.chain.extend(b"first block".to_vec());

    a.connect("b");

    assert!(wait_until(WAIT, || a.chain.chain_height().unwrap() == 1).await);
    assert_eq!(a.chain.block_at(1).unwrap(), Some(tip));
    // b asked a too; a only had genesis, which b already holds.
    assert_eq!(b.chain.chain_height().unwrap(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn light_node_receives_header_window() {
    let hub = MemoryHub::new();
    let mut light = fast_config();
    light.network.push.light_node = true;
    let a = TestNode::spawn(&hub, "a", light);
    let b = TestNode::spawn(&hub, "b", fast_config());
    for i in 0..3u8 {
        b.chain.extend(vec![i; 16]);
    }

    a.connect("b");

    assert!(wait_until(WAIT, || a.chain.header_height().unwrap() == 3).await);
    assert_eq!(a.chain.chain_height().unwrap(), 0);
    assert_eq!(a.chain.header_at(3).unwrap(), b.chain.header_at(3).unwrap());

    a.stop().await;
    b.stop().await;
}

fn push_request(from: &PeerId, to: &PeerId) -> Vec<u8> {
    PushMessage {
        kind: PushKind::PushRequest,
        from: from.clone(),
        to: to.clone(),
        request_id: 1,
        timestamp: unix_now(),
        client_version: "raw/0.0.1".to_string(),
        block_height: 0,
        block_data: None,
        block_headers: Vec::new(),
        is_light_node: false,
    }
    .encode()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_request_from_untrusted_peer_is_ignored() {
    let hub = MemoryHub::new();
    let a = TestNode::spawn(&hub, "a", fast_config());
    a.chain.extend(b"secret tip".to_vec());
    let mut x = RawPeer::new(&hub, "x");
    x.connect("a");
    assert!(wait_until(WAIT, || status(&a, "x") == Some(PeerStatus::Greylisted)).await);

    // Greylisted requester.
    x.publish(PUSH_TOPIC, push_request(&x.id, &a.id));
    // Unknown requester, delivered straight to the dispatcher.
    let ghost = PeerId::from("ghost");
    a.node.handle_event(TransportEvent::Message {
        topic: PUSH_TOPIC.to_string(),
        data: push_request(&ghost, &a.id),
        from: ghost.clone(),
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    let responses: Vec<PushMessage> = x.drain();
    assert!(responses.iter().all(|m| m.kind != PushKind::PushResponse), "got {responses:?}");
    assert_eq!(a.node.controller().peer(&x.id).unwrap().misbehavior_score, 0);

    // Once trusted, the same request is answered.
    a.node.controller().promote(&x.id);
    x.publish(PUSH_TOPIC, push_request(&x.id, &a.id));
    assert!(
        wait_until(WAIT, || {
            x.drain::<PushMessage>().iter().any(|m| m.kind == PushKind::PushResponse && m.block_height == 1)
        })
        .await
    );

    a.stop().await;
}

// ---------------------------------------------------------------------------
// Inactivity
// ---------------------------------------------------------------------------

struct InactivityFixture {
    seed: TestNode,
    suspect: RawPeer,
    reporters: Vec<RawPeer>,
}

async fn inactivity_fixture(is_seed: bool) -> InactivityFixture {
    let hub = MemoryHub::new();
    let mut config = fast_config();
    config.network.inactivity.is_seed_node = is_seed;
    config.network.inactivity.seed_node_threshold = 3;
    let seed = TestNode::spawn(&hub, "seed", config);

    let suspect = RawPeer::new(&hub, "t");
    suspect.connect("seed");
    let reporters: Vec<RawPeer> = ["r1", "r2", "r3"]
        .into_iter()
        .map(|name| {
            let r = RawPeer::new(&hub, name);
            r.connect("seed");
            r
        })
        .collect();

    assert!(wait_until(WAIT, || seed.node.peers().len() == 4).await);
    assert!(seed.node.controller().promote(&suspect.id));
    // Reports only count from seed nodes, i.e. whitelisted peers.
    for r in &reporters {
        assert!(seed.node.controller().promote(&r.id));
    }
    InactivityFixture { seed, suspect, reporters }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_reporters_do_not_reach_quorum_three_do() {
    let InactivityFixture {
        seed,
        suspect,
        mut reporters,
    } = inactivity_fixture(true).await;

    reporters[0].report_inactive(&suspect.id);
    reporters[1].report_inactive(&suspect.id);
    // Repeats from the same reporter do not count twice.
    reporters[1].report_inactive(&suspect.id);

    assert!(
        wait_until(WAIT, || {
            seed.node
                .inactivity()
                .evidence_for(&suspect.id)
                .is_some_and(|ev| ev.report_count == 3)
        })
        .await
    );
    // Several probe ticks pass without a verdict.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(seed.node.peer_status(&suspect.id), Some(PeerStatus::Whitelisted));
    assert_eq!(seed.node.inactivity().evidence_for(&suspect.id).unwrap().reporters.len(), 2);

    reporters[2].report_inactive(&suspect.id);

    assert!(wait_until(WAIT, || seed.node.peer_status(&suspect.id) == Some(PeerStatus::Greylisted)).await);
    assert!(seed.node.inactivity().evidence_for(&suspect.id).is_none());

    // The consolidated report reaches the other peers.
    assert!(
        wait_until(WAIT, || {
            reporters[0].drain::<InactivityMessage>().iter().any(|m| {
                m.kind == InactivityKind::InactivityReport && m.from == seed.id && m.target_peer == suspect.id
            })
        })
        .await
    );

    seed.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn greylisted_reporters_are_not_counted() {
    let InactivityFixture {
        seed,
        suspect,
        reporters,
    } = inactivity_fixture(true).await;
    for r in &reporters {
        seed.node.controller().demote(&r.id);
    }

    for r in &reporters {
        r.report_inactive(&suspect.id);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(seed.node.inactivity().evidence_for(&suspect.id).is_none());
    assert_eq!(seed.node.peer_status(&suspect.id), Some(PeerStatus::Whitelisted));

    seed.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_seed_node_records_but_does_not_act() {
    let InactivityFixture {
        seed: node,
        suspect,
        reporters,
    } = inactivity_fixture(false).await;

    for r in &reporters {
        r.report_inactive(&suspect.id);
    }

    assert!(
        wait_until(WAIT, || {
            node.node
                .inactivity()
                .evidence_for(&suspect.id)
                .is_some_and(|ev| ev.reporters.len() == 3)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.node.peer_status(&suspect.id), Some(PeerStatus::Whitelisted));

    // Seed duty switched on later acts on the stored evidence.
    node.node.inactivity().set_seed_node(true);
    assert!(wait_until(WAIT, || node.node.peer_status(&suspect.id) == Some(PeerStatus::Greylisted)).await);

    node.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn seed_node_probes_silent_peers() {
    let hub = MemoryHub::new();
    let mut config = fast_config();
    config.network.inactivity.is_seed_node = true;
    config.network.inactivity.seed_node_threshold = 1;
    config.network.inactivity.inactivity_timeout = Duration::from_secs(60);
    let seed = TestNode::spawn(&hub, "seed", config);
    let silent = RawPeer::new(&hub, "quiet");
    silent.connect("seed");

    assert!(wait_until(WAIT, || status(&seed, "quiet").is_some()).await);
    seed.node.controller().promote(&silent.id);
    seed.node
        .controller()
        .record_activity_at(&silent.id, unix_now().saturating_sub(3600), None);

    assert!(wait_until(WAIT, || status(&seed, "quiet") == Some(PeerStatus::Greylisted)).await);

    seed.stop().await;
}
