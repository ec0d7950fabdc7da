//! Node composition and event loop.
//!
//! [`BarNode`] owns the admission controller and the three protocol
//! coordinators, feeds them transport events, and runs their background
//! tasks until a shared shutdown signal fires.
//!
//! The transport and chain are injected, so the same node runs over libp2p
//! ([`BarNode::start`]) or over an in-memory hub in tests.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bar_core::chain::MemoryChain;
use bar_core::error::BarError;
use bar_core::traits::{BlockSink, ChainState, Transport, TransportEvent};
use bar_core::types::{PeerId, PeerRecord, PeerStatus, ReputationRecord};
use bar_network::{
    ALL_TOPICS, HANDSHAKE_TOPIC, HandshakeCoordinator, INACTIVITY_TOPIC, InactivityCoordinator, NetworkNode,
    OptimisticPushCoordinator, PUSH_TOPIC, PeerAdmissionController,
};

use crate::config::NodeConfig;

/// A running BAR node.
pub struct BarNode {
    config: NodeConfig,
    local_id: PeerId,
    controller: Arc<PeerAdmissionController>,
    handshake: Arc<HandshakeCoordinator>,
    inactivity: Arc<InactivityCoordinator>,
    push: Arc<OptimisticPushCoordinator>,
    transport: Arc<dyn Transport>,
    chain: Arc<dyn ChainState>,
    /// libp2p handle, kept to stop the swarm on shutdown.
    network: Option<Arc<NetworkNode>>,
    /// Taken by [`run`](Self::run).
    events: Mutex<Option<broadcast::Receiver<TransportEvent>>>,
    promotions: Mutex<Option<mpsc::UnboundedReceiver<PeerId>>>,
    shutdown: watch::Sender<bool>,
}

impl BarNode {
    /// Compose a node over an existing transport and chain.
    ///
    /// `local_addr` is the address this node advertises in handshakes.
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        events: broadcast::Receiver<TransportEvent>,
        local_addr: impl Into<String>,
        chain: Arc<dyn ChainState>,
        sink: Arc<dyn BlockSink>,
    ) -> Result<Arc<Self>, BarError> {
        Self::compose(config, transport, events, local_addr.into(), chain, sink, None)
    }

    fn compose(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        events: broadcast::Receiver<TransportEvent>,
        local_addr: String,
        chain: Arc<dyn ChainState>,
        sink: Arc<dyn BlockSink>,
        network: Option<Arc<NetworkNode>>,
    ) -> Result<Arc<Self>, BarError> {
        config.validate()?;
        let net = &config.network;

        let controller = Arc::new(PeerAdmissionController::new(net.policy.clone()));
        let promotions = OptimisticPushCoordinator::subscribe_promotions(&controller);

        let handshake = Arc::new(HandshakeCoordinator::new(
            net,
            local_addr,
            Arc::clone(&controller),
            Arc::clone(&transport),
        ));
        let inactivity = Arc::new(InactivityCoordinator::new(
            net.inactivity.clone(),
            net.client_version.clone(),
            Arc::clone(&controller),
            Arc::clone(&transport),
        ));
        let push = Arc::new(OptimisticPushCoordinator::new(
            net.push.clone(),
            net.client_version.clone(),
            Arc::clone(&controller),
            Arc::clone(&transport),
            Arc::clone(&chain),
            sink,
        ));

        let (shutdown, _) = watch::channel(false);
        let local_id = transport.local_peer_id();
        info!(peer = %local_id, network = %net.network_id, seed = net.inactivity.is_seed_node, "node: created");

        Ok(Arc::new(Self {
            config,
            local_id,
            controller,
            handshake,
            inactivity,
            push,
            transport,
            chain,
            network,
            events: Mutex::new(Some(events)),
            promotions: Mutex::new(Some(promotions)),
            shutdown,
        }))
    }

    /// Start a libp2p-backed node with an in-memory chain.
    pub async fn start(mut config: NodeConfig) -> Result<Arc<Self>, BarError> {
        if config.network.node_key_path.is_none() {
            config.network.node_key_path = Some(config.node_key_path());
        }
        let (network, events) = NetworkNode::start(&config.network).await?;
        let network = Arc::new(network);
        let chain = Arc::new(MemoryChain::new());
        let local_addr = config.network.listen_multiaddr();

        Self::compose(
            config,
            Arc::clone(&network) as Arc<dyn Transport>,
            events,
            local_addr,
            Arc::clone(&chain) as Arc<dyn ChainState>,
            chain as Arc<dyn BlockSink>,
            Some(network),
        )
    }

    /// Join every BAR topic and dial the configured seed addresses, up to
    /// `max_outgoing` of them. Returns the number of dials queued.
    pub fn bootstrap(&self) -> Result<usize, BarError> {
        for topic in ALL_TOPICS {
            self.transport.join_topic(topic)?;
        }

        let policy = &self.config.network.policy;
        if policy.seed_addresses.len() > policy.max_outgoing {
            warn!(
                configured = policy.seed_addresses.len(),
                max_outgoing = policy.max_outgoing,
                "node: more seed addresses than outgoing slots"
            );
        }
        let mut dialed = 0;
        for addr in policy.seed_addresses.iter().take(policy.max_outgoing) {
            match self.transport.connect(addr) {
                Ok(()) => dialed += 1,
                Err(e) => warn!(%addr, error = %e, "node: seed dial failed"),
            }
        }
        info!(dialed, "node: bootstrap complete");
        Ok(dialed)
    }

    /// Route one transport event to the owning coordinator.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected { peer, address } => self.on_peer_connected(&peer, &address),
            TransportEvent::PeerDisconnected(peer) => {
                debug!(%peer, "node: peer disconnected");
                self.handshake.forget(&peer);
            }
            TransportEvent::Message { topic, data, from } => {
                if from == self.local_id {
                    return;
                }
                if self.controller.is_banned(&from) {
                    debug!(peer = %from, %topic, "node: dropping message from banned peer");
                    return;
                }
                self.controller.record_activity(&from, None);
                match topic.as_str() {
                    HANDSHAKE_TOPIC => self.handshake.handle(&from, &data),
                    INACTIVITY_TOPIC => self.inactivity.handle(&from, &data),
                    PUSH_TOPIC => self.push.handle(&from, &data),
                    other => debug!(topic = other, "node: message on unknown topic"),
                }
            }
        }
    }

    fn on_peer_connected(&self, peer: &PeerId, address: &str) {
        if *peer == self.local_id || self.controller.is_banned(peer) {
            return;
        }
        self.controller.add_peer(peer, address);
        if self.controller.peer_status(peer) == Some(PeerStatus::Greylisted) {
            if let Err(e) = self.handshake.initiate(peer, address) {
                warn!(%peer, error = %e, "node: handshake initiation failed");
            }
        }
    }

    /// Expire stale handshakes, retry deferred promotions and purge old
    /// reputation records.
    pub fn maintenance_tick(&self, now: Instant) {
        let expired = self.handshake.expire_stale(now);
        let promoted = self.handshake.retry_deferred();
        let purged = self.controller.cleanup_reputation_records();
        if expired + promoted + purged > 0 {
            debug!(expired, promoted, purged, "node: maintenance tick");
        }
    }

    /// Enter `round`: the controller's selection round and the handshake seed
    /// both move forward.
    pub fn advance_round(&self, round: u64) {
        self.controller.set_round(round);
        self.handshake.update_round(round);
    }

    /// Gossip targets for `round`.
    pub fn select_peers(&self, round: u64) -> Vec<PeerId> {
        self.controller.select_peers(round)
    }

    /// Gossip targets `round` would get, leaving node state untouched.
    pub fn preview_selection(&self, round: u64) -> Vec<PeerId> {
        self.controller.preview_selection(round)
    }

    /// Run the dispatcher and every background task until [`shutdown`](Self::shutdown).
    ///
    /// Can only be called once; later calls return immediately.
    pub async fn run(self: &Arc<Self>) {
        let Some(events) = self.events.lock().take() else {
            warn!("node: run called twice");
            return;
        };
        let promotions = self.promotions.lock().take();

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(
            Arc::clone(&self.inactivity).run(self.shutdown.subscribe()),
        ));
        if let Some(promotions) = promotions {
            tasks.push(tokio::spawn(
                Arc::clone(&self.push).run(promotions, self.shutdown.subscribe()),
            ));
        }
        let node = Arc::clone(self);
        tasks.push(tokio::spawn(async move { node.maintenance_loop().await }));

        self.dispatch_loop(events).await;

        for task in tasks {
            let _ = task.await;
        }
        if let Some(network) = &self.network {
            network.shutdown();
        }
        info!("node: stopped");
    }

    async fn dispatch_loop(&self, mut events: broadcast::Receiver<TransportEvent>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return;
        }
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "node: lagged behind on transport events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("node: transport event channel closed");
                        self.shutdown.send_replace(true);
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn maintenance_loop(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.maintenance_tick(Instant::now()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Signal every task started by [`run`](Self::run) to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // --- Query methods for RPC ---

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<PeerAdmissionController> {
        &self.controller
    }

    pub fn handshake(&self) -> &Arc<HandshakeCoordinator> {
        &self.handshake
    }

    pub fn inactivity(&self) -> &Arc<InactivityCoordinator> {
        &self.inactivity
    }

    pub fn push(&self) -> &Arc<OptimisticPushCoordinator> {
        &self.push
    }

    pub fn chain_height(&self) -> Result<u64, BarError> {
        Ok(self.chain.chain_height()?)
    }

    /// Number of open libp2p connections, zero for other transports.
    pub fn connection_count(&self) -> usize {
        self.network.as_ref().map(|n| n.peer_count()).unwrap_or(0)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.controller.peers()
    }

    pub fn peer_status(&self, peer: &PeerId) -> Option<PeerStatus> {
        self.controller.peer_status(peer)
    }

    pub fn reputation_records(&self) -> Vec<ReputationRecord> {
        self.controller.reputation_records()
    }
}
