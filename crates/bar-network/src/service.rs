//! libp2p network node implementing [`Transport`].
//!
//! Uses a command-channel architecture: the [`NetworkNode`] handle sends
//! commands over an mpsc channel to a background swarm task running on tokio,
//! which turns swarm events into [`TransportEvent`]s on a broadcast channel.
//!
//! A peer is reported as connected once it subscribes to the handshake topic,
//! not when the TCP connection opens, so the first handshake ping has
//! somewhere to go.

use crate::behaviour::{self, BarBehaviour, KAD_PROTOCOL, PROTOCOL_VERSION};
use crate::config::NetworkConfig;
use crate::protocol::HANDSHAKE_TOPIC;
use bar_core::error::NetworkError;
use bar_core::traits::{Transport, TransportEvent};
use bar_core::types::PeerId as BarPeerId;
use libp2p::futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::identity::Keypair;
use libp2p::kad;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, StreamProtocol, SwarmBuilder, identify, mdns};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Commands sent from [`NetworkNode`] to the background swarm task.
#[derive(Debug)]
enum Command {
    Publish { topic: String, data: Vec<u8> },
    Subscribe(String),
    Dial(Multiaddr),
    Shutdown,
}

/// Shared atomic state between the [`NetworkNode`] handle and the swarm task.
struct SharedState {
    /// Number of peers with at least one open connection.
    peer_count: AtomicUsize,
    running: AtomicBool,
}

/// libp2p transport handle.
///
/// Created via [`NetworkNode::start`], which spawns the swarm task. All
/// [`Transport`] methods queue a command and return immediately.
pub struct NetworkNode {
    command_tx: mpsc::UnboundedSender<Command>,
    state: Arc<SharedState>,
    local_peer_id: PeerId,
}

impl std::fmt::Debug for NetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkNode")
            .field("peer_id", &self.local_peer_id)
            .field("peer_count", &self.state.peer_count.load(Ordering::Relaxed))
            .field("running", &self.state.running.load(Ordering::Relaxed))
            .finish()
    }
}

/// Load an Ed25519 keypair from a file, or generate and save a new one.
///
/// The file stores the raw 32-byte Ed25519 secret so the peer id is stable
/// across restarts. New files are created with mode `0o600` on Unix.
pub fn load_or_generate_keypair(path: &Path) -> Result<Keypair, NetworkError> {
    let setup = |what: &str, e: &dyn std::fmt::Display| {
        NetworkError::Setup(format!("{what} '{}': {e}", path.display()))
    };

    if path.exists() {
        let bytes = std::fs::read(path).map_err(|e| setup("failed to read node key", &e))?;
        let keypair = Keypair::ed25519_from_bytes(bytes).map_err(|e| setup("invalid node key in", &e))?;
        info!(path = %path.display(), "loaded existing node identity key");
        return Ok(keypair);
    }

    let keypair = Keypair::generate_ed25519();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| setup("failed to create directory for", &e))?;
    }
    let ed_keypair = keypair
        .clone()
        .try_into_ed25519()
        .map_err(|e| setup("keypair is not Ed25519 for", &e))?;
    std::fs::write(path, ed_keypair.secret().as_ref()).map_err(|e| setup("failed to write node key", &e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| setup("failed to set permissions on", &e))?;
    }

    info!(path = %path.display(), "generated new node identity key");
    Ok(keypair)
}

impl NetworkNode {
    /// Start the swarm, returning the transport handle and its event stream.
    pub async fn start(config: &NetworkConfig) -> Result<(Self, broadcast::Receiver<TransportEvent>), NetworkError> {
        let keypair = match &config.node_key_path {
            Some(path) => load_or_generate_keypair(path)?,
            None => Keypair::generate_ed25519(),
        };
        let local_peer_id = PeerId::from(keypair.public());
        info!(%local_peer_id, network = %config.network_id, "starting network node");

        let gossipsub = behaviour::build_gossipsub(&keypair, config.gossipsub_heartbeat)?;

        let kad_config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL));
        let store = kad::store::MemoryStore::new(local_peer_id);
        let kademlia = kad::Behaviour::with_config(local_peer_id, store, kad_config);

        let identify = identify::Behaviour::new(identify::Config::new(
            PROTOCOL_VERSION.to_string(),
            keypair.public(),
        ));

        let mdns = if config.enable_mdns {
            Some(
                mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)
                    .map_err(|e| NetworkError::Setup(format!("mDNS: {e}")))?,
            )
        } else {
            None
        };

        let behaviour = BarBehaviour {
            gossipsub,
            kademlia,
            identify,
            mdns: mdns.into(),
        };

        let mut swarm = SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| NetworkError::Setup(format!("TCP transport: {e}")))?
            .with_behaviour(|_| Ok(behaviour))
            .map_err(|e| NetworkError::Setup(format!("behaviour: {e}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        let listen_addr: Multiaddr = config
            .listen_multiaddr()
            .parse()
            .map_err(|e| NetworkError::InvalidAddress(format!("{}: {e}", config.listen_multiaddr())))?;
        swarm
            .listen_on(listen_addr)
            .map_err(|e| NetworkError::Setup(format!("listen: {e}")))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let state = Arc::new(SharedState {
            peer_count: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });

        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            swarm_event_loop(swarm, command_rx, event_tx, state_clone).await;
        });

        Ok((
            NetworkNode {
                command_tx,
                state,
                local_peer_id,
            },
            event_rx,
        ))
    }

    pub fn libp2p_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.state.peer_count.load(Ordering::Relaxed)
    }

    /// Request the swarm to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    fn command(&self, cmd: Command) -> Result<(), NetworkError> {
        self.command_tx.send(cmd).map_err(|_| NetworkError::TransportStopped)
    }
}

impl Transport for NetworkNode {
    fn local_peer_id(&self) -> BarPeerId {
        BarPeerId::new(self.local_peer_id.to_string())
    }

    fn join_topic(&self, topic: &str) -> Result<(), NetworkError> {
        self.command(Command::Subscribe(topic.to_string()))
    }

    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetworkError> {
        self.command(Command::Publish {
            topic: topic.to_string(),
            data,
        })
    }

    fn connect(&self, address: &str) -> Result<(), NetworkError> {
        let addr: Multiaddr = address
            .parse()
            .map_err(|e| NetworkError::InvalidAddress(format!("{address}: {e}")))?;
        self.command(Command::Dial(addr))
    }
}

fn bar_id(peer: &PeerId) -> BarPeerId {
    BarPeerId::new(peer.to_string())
}

/// Background task running the libp2p swarm event loop.
async fn swarm_event_loop(
    mut swarm: libp2p::Swarm<BarBehaviour>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: broadcast::Sender<TransportEvent>,
    state: Arc<SharedState>,
) {
    let handshake_topic = IdentTopic::new(HANDSHAKE_TOPIC).hash();
    // Remote address of each connected peer, reported once it subscribes.
    let mut addresses: HashMap<PeerId, String> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Publish { topic, data }) => {
                        let topic = IdentTopic::new(topic);
                        if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, data) {
                            debug!("gossipsub publish error: {e}");
                        }
                    }
                    Some(Command::Subscribe(topic)) => {
                        if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&IdentTopic::new(&topic)) {
                            warn!(%topic, "gossipsub subscribe error: {e}");
                        }
                    }
                    Some(Command::Dial(addr)) => {
                        if let Err(e) = swarm.dial(addr) {
                            debug!("dial error: {e}");
                        }
                    }
                    Some(Command::Shutdown) | None => {
                        info!("shutting down swarm event loop");
                        state.running.store(false, Ordering::Relaxed);
                        break;
                    }
                }
            }
            event = swarm.next() => {
                let Some(event) = event else {
                    state.running.store(false, Ordering::Relaxed);
                    break;
                };

                match event {
                    SwarmEvent::Behaviour(behaviour::BarBehaviourEvent::Gossipsub(
                        gossipsub::Event::Message { propagation_source, message, .. },
                    )) => {
                        let from = message.source.unwrap_or(propagation_source);
                        let _ = event_tx.send(TransportEvent::Message {
                            topic: message.topic.as_str().to_string(),
                            data: message.data,
                            from: bar_id(&from),
                        });
                    }

                    SwarmEvent::Behaviour(behaviour::BarBehaviourEvent::Gossipsub(
                        gossipsub::Event::Subscribed { peer_id, topic },
                    )) => {
                        if topic == handshake_topic {
                            let address = addresses.get(&peer_id).cloned().unwrap_or_default();
                            debug!(%peer_id, %address, "peer joined handshake topic");
                            let _ = event_tx.send(TransportEvent::PeerConnected {
                                peer: bar_id(&peer_id),
                                address,
                            });
                        }
                    }

                    SwarmEvent::Behaviour(behaviour::BarBehaviourEvent::Mdns(
                        mdns::Event::Discovered(peers),
                    )) => {
                        for (peer_id, addr) in peers {
                            debug!(%peer_id, %addr, "mDNS discovered peer");
                            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                            if !swarm.is_connected(&peer_id) {
                                let _ = swarm.dial(addr);
                            }
                        }
                    }

                    SwarmEvent::Behaviour(behaviour::BarBehaviourEvent::Identify(
                        identify::Event::Received { peer_id, info, .. },
                    )) => {
                        debug!(%peer_id, "identify received");
                        for addr in info.listen_addrs {
                            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                        }
                    }

                    SwarmEvent::ConnectionEstablished { peer_id, endpoint, num_established, .. } => {
                        if num_established.get() == 1 {
                            let count = state.peer_count.fetch_add(1, Ordering::Relaxed) + 1;
                            info!(%peer_id, count, "peer connected");
                            addresses.insert(peer_id, endpoint.get_remote_address().to_string());
                        }
                    }

                    SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                        if num_established == 0 {
                            let _ = state
                                .peer_count
                                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
                            addresses.remove(&peer_id);
                            info!(%peer_id, count = state.peer_count.load(Ordering::Relaxed), "peer disconnected");
                            let _ = event_tx.send(TransportEvent::PeerDisconnected(bar_id(&peer_id)));
                        }
                    }

                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(%address, "listening on");
                    }

                    SwarmEvent::ListenerError { error, .. } => {
                        error!(%error, "listener error");
                    }

                    _ => {}
                }
            }
        }
    }
}
