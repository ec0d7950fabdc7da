//! Trait interfaces for the collaborators of the BAR layer.
//!
//! These traits define the contracts with code outside the subsystem:
//! - [`Transport`]: pub/sub P2P transport (bar-network provides a libp2p and
//!   an in-memory implementation)
//! - [`ChainState`]: read-only view of the local chain
//! - [`BlockSink`]: ingestion path for chain data received from peers
//!
//! Inbound deliveries are not part of [`Transport`]: each implementation hands
//! out a receiver of [`TransportEvent`]s when it is constructed.

use crate::error::{ChainError, NetworkError};
use crate::types::{Block, BlockHeader, PeerId};

/// An event delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A payload published on `topic` by `from`.
    Message { topic: String, data: Vec<u8>, from: PeerId },
    /// A new connection was established.
    PeerConnected { peer: PeerId, address: String },
    /// The last connection to a peer closed.
    PeerDisconnected(PeerId),
}

/// Pub/sub transport.
///
/// All methods are non-blocking: implementations queue work for a background
/// task and only report whether the request could be queued.
pub trait Transport: Send + Sync {
    /// Identifier this node is known by on the network.
    fn local_peer_id(&self) -> PeerId;

    /// Register interest in a named topic.
    fn join_topic(&self, topic: &str) -> Result<(), NetworkError>;

    /// Publish an opaque payload to a named topic.
    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetworkError>;

    /// Connect to a peer by transport address.
    fn connect(&self, address: &str) -> Result<(), NetworkError>;
}

/// Read-only view of the blockchain.
pub trait ChainState: Send + Sync {
    /// Height of the best full block.
    fn chain_height(&self) -> Result<u64, ChainError>;

    /// Full block at `height`, if stored.
    fn block_at(&self, height: u64) -> Result<Option<Block>, ChainError>;

    /// Header at `height`. Light stores may hold headers without bodies.
    ///
    /// Default implementation delegates to [`block_at`](Self::block_at).
    fn header_at(&self, height: u64) -> Result<Option<BlockHeader>, ChainError> {
        Ok(self.block_at(height)?.map(|b| b.header))
    }

    /// Height of the best known header (equal to the chain height unless
    /// headers were imported ahead of bodies).
    fn header_height(&self) -> Result<u64, ChainError> {
        self.chain_height()
    }

    /// Whether a full block is stored at `height`.
    fn has_block(&self, height: u64) -> Result<bool, ChainError> {
        Ok(self.block_at(height)?.is_some())
    }
}

/// Accepts chain data received from peers.
///
/// Implementations perform their own consensus validation; the BAR layer only
/// checks structural integrity before handing data over.
pub trait BlockSink: Send + Sync {
    /// Import a full block extending the local chain.
    fn import_block(&self, block: Block) -> Result<(), ChainError>;

    /// Import a contiguous run of headers (light-node mode). Returns the number
    /// of headers that were new.
    fn import_headers(&self, headers: Vec<BlockHeader>) -> Result<usize, ChainError>;
}
