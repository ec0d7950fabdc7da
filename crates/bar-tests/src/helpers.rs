//! Shared fixtures for multi-node tests.

use std::sync::Arc;
use std::time::Duration;

use bar_core::chain::MemoryChain;
use bar_core::traits::{BlockSink, ChainState, Transport, TransportEvent};
use bar_core::types::{PeerId, RoundSeed, unix_now};
use bar_network::{
    ALL_TOPICS, HANDSHAKE_TOPIC, HandshakeKind, HandshakeMessage, INACTIVITY_TOPIC, InactivityKind,
    InactivityMessage, MemoryHub, MemoryTransport, WireMessage,
};
use bar_node_lib::{BarNode, NodeConfig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Node configuration with timers short enough for tests.
pub fn fast_config() -> NodeConfig {
    let mut config = NodeConfig {
        maintenance_interval: Duration::from_millis(20),
        ..NodeConfig::default()
    };
    config.network.network_id = "bar-test".to_string();
    config.network.policy.handshake_timeout = Duration::from_secs(2);
    config.network.inactivity.check_interval = Duration::from_millis(50);
    config.network.push.push_timeout = Duration::from_secs(2);
    config
}

/// Address of a named endpoint on the hub.
pub fn addr(name: &str) -> String {
    format!("mem/{name}")
}

/// A [`BarNode`] running on a [`MemoryHub`].
pub struct TestNode {
    pub id: PeerId,
    pub node: Arc<BarNode>,
    pub chain: Arc<MemoryChain>,
    pub transport: Arc<MemoryTransport>,
    task: JoinHandle<()>,
}

impl TestNode {
    /// Create, bootstrap and start a node. Must be called inside a tokio runtime.
    pub fn spawn(hub: &Arc<MemoryHub>, name: &str, config: NodeConfig) -> Self {
        let (transport, events) = hub.endpoint(name, addr(name));
        let chain = Arc::new(MemoryChain::new());
        let node = BarNode::new(
            config,
            Arc::clone(&transport) as Arc<dyn Transport>,
            events,
            addr(name),
            Arc::clone(&chain) as Arc<dyn ChainState>,
            Arc::clone(&chain) as Arc<dyn BlockSink>,
        )
        .expect("valid test config");
        node.bootstrap().expect("bootstrap");

        let runner = Arc::clone(&node);
        let task = tokio::spawn(async move { runner.run().await });
        Self {
            id: PeerId::from(name),
            node,
            chain,
            transport,
            task,
        }
    }

    /// Dial another endpoint by name.
    pub fn connect(&self, other: &str) {
        self.transport.connect(&addr(other)).expect("connect");
    }

    /// Stop the node and wait for its tasks.
    pub async fn stop(self) {
        self.node.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// A hand-driven endpoint that speaks the wire protocol directly, for
/// playing a misbehaving or scripted peer.
pub struct RawPeer {
    pub id: PeerId,
    pub transport: Arc<MemoryTransport>,
    pub events: broadcast::Receiver<TransportEvent>,
    nonce: u64,
}

impl RawPeer {
    pub fn new(hub: &Arc<MemoryHub>, name: &str) -> Self {
        let (transport, events) = hub.endpoint(name, addr(name));
        for topic in ALL_TOPICS {
            transport.join_topic(topic).expect("join");
        }
        Self {
            id: PeerId::from(name),
            transport,
            events,
            nonce: 0,
        }
    }

    pub fn connect(&self, other: &str) {
        self.transport.connect(&addr(other)).expect("connect");
    }

    /// A handshake message from this peer with a correct seed for `round`
    /// on the network `network_id`.
    pub fn handshake(&mut self, kind: HandshakeKind, to: &PeerId, round: u64, network_id: &str) -> HandshakeMessage {
        let mut config = fast_config().network;
        config.network_id = network_id.to_string();
        let seed = RoundSeed::derive(&config.handshake_key(), round);
        self.nonce += 1;
        HandshakeMessage {
            kind,
            from: self.id.clone(),
            to: to.clone(),
            round,
            round_seed: seed.to_hex(),
            timestamp: unix_now(),
            client_version: "raw/0.0.1".to_string(),
            addr_received: String::new(),
            addr_from: addr(self.id.as_str()),
            last_round: round.saturating_sub(1),
            nonce: self.nonce,
        }
    }

    pub fn send_handshake(&self, msg: &HandshakeMessage) {
        self.publish(HANDSHAKE_TOPIC, msg.encode().expect("encode"));
    }

    /// Broadcast an inactivity report about `suspect`.
    pub fn report_inactive(&self, suspect: &PeerId) {
        let msg = InactivityMessage {
            kind: InactivityKind::InactivityReport,
            from: self.id.clone(),
            to: PeerId::default(),
            target_peer: suspect.clone(),
            timestamp: unix_now(),
            client_version: "raw/0.0.1".to_string(),
            reason: "no response".to_string(),
            evidence: vec![format!("reporter:{}", self.id)],
        };
        self.publish(INACTIVITY_TOPIC, msg.encode().expect("encode"));
    }

    pub fn publish(&self, topic: &str, data: Vec<u8>) {
        self.transport.publish(topic, data).expect("publish");
    }

    /// Drain pending events, returning the decodable messages of type `M`.
    /// Everything else is discarded.
    pub fn drain<M: WireMessage>(&mut self) -> Vec<M> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let TransportEvent::Message { topic, data, .. } = event {
                if topic == M::TOPIC {
                    if let Ok(msg) = M::decode(&data) {
                        out.push(msg);
                    }
                }
            }
        }
        out
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
