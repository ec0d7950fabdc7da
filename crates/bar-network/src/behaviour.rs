//! Composite libp2p [`NetworkBehaviour`] for the BAR transport.
//!
//! Combines Gossipsub (the three BAR topics), Kademlia (peer routing),
//! Identify (address exchange), and optional mDNS (local discovery).

use bar_core::constants::MAX_MESSAGE_SIZE;
use bar_core::error::NetworkError;
use libp2p::gossipsub;
use libp2p::identity::Keypair;
use libp2p::kad;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, mdns};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Protocol version string advertised through Identify.
pub const PROTOCOL_VERSION: &str = "/bar/1.0.0";

/// Kademlia protocol name for the BAR DHT.
pub const KAD_PROTOCOL: &str = "/bar/kad/1.0.0";

#[derive(NetworkBehaviour)]
pub struct BarBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    /// Disabled on mainnet.
    pub mdns: libp2p::swarm::behaviour::toggle::Toggle<mdns::tokio::Behaviour>,
}

/// Build a gossipsub behaviour whose messages are signed by the node key.
///
/// Message ids are SHA-256 of the payload. Every BAR message carries a fresh
/// timestamp, so identical payloads really are duplicates. Signing with the
/// node identity makes `message.source` the author's peer id, which the BAR
/// protocols compare against the `from` field.
pub fn build_gossipsub(keypair: &Keypair, heartbeat: Duration) -> Result<gossipsub::Behaviour, NetworkError> {
    let message_id_fn = |message: &gossipsub::Message| {
        let hash = Sha256::digest(&message.data);
        gossipsub::MessageId::from(hash.to_vec())
    };

    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(heartbeat)
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(MAX_MESSAGE_SIZE)
        .message_id_fn(message_id_fn)
        .build()
        .map_err(|e| NetworkError::Setup(format!("gossipsub config: {e}")))?;

    gossipsub::Behaviour::new(gossipsub::MessageAuthenticity::Signed(keypair.clone()), config)
        .map_err(|e| NetworkError::Setup(format!("gossipsub behaviour: {e}")))
}
