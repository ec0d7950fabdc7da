//! # bar-network: BAR peer admission over libp2p.
//!
//! Implements the peer-admission layer of a BAR-style gossip network:
//! a greylist/whitelist/banlist controller with proof-of-misbehaviour
//! scoring, a round-seeded three-way handshake, seed-node inactivity
//! detection, and optimistic block push to newly trusted peers.
//!
//! The coordinators are transport-agnostic and talk to the network through
//! [`bar_core::traits::Transport`]. [`NetworkNode::start`] provides the
//! libp2p implementation and [`MemoryHub`] an in-process one for tests.

pub mod admission;
pub mod behaviour;
pub mod config;
pub mod handshake;
pub mod inactivity;
pub mod memory;
pub mod protocol;
pub mod push;
pub mod service;

pub use admission::{PeerAdmissionController, StatusCallback, select_indices};
pub use config::{AdmissionPolicy, InactivityConfig, NetworkConfig, PushConfig};
pub use handshake::HandshakeCoordinator;
pub use inactivity::{InactivityCoordinator, InactivityEvidence};
pub use memory::{MemoryHub, MemoryTransport};
pub use protocol::{
    ALL_TOPICS, HANDSHAKE_TOPIC, HandshakeKind, HandshakeMessage, INACTIVITY_TOPIC, InactivityKind,
    InactivityMessage, PUSH_TOPIC, PushKind, PushMessage, WireMessage,
};
pub use push::OptimisticPushCoordinator;
pub use service::{NetworkNode, load_or_generate_keypair};
