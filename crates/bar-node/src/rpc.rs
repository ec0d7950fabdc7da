//! JSON-RPC diagnostics server for the BAR node.
//!
//! Uses jsonrpsee 0.24 to expose the admission controller's listing
//! accessors: node summary, peer lists, per-peer status, round selection,
//! and ban history.

use std::sync::Arc;

use jsonrpsee::core::async_trait;
use jsonrpsee::proc_macros::rpc;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

use bar_core::error::{BarError, NetworkError};
use bar_core::types::{PeerId, PeerRecord, PeerStatus, ReputationRecord};

use crate::node::BarNode;

/// JSON representation of node info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoJson {
    pub peer_id: String,
    pub network_id: String,
    pub client_version: String,
    /// Current selection round.
    pub round: u64,
    /// Local chain height.
    pub blocks: u64,
    pub greylisted: usize,
    pub whitelisted: usize,
    pub banned: usize,
    /// Open transport connections (libp2p only).
    pub connections: usize,
    pub seed_node: bool,
    pub pending_handshakes: usize,
    pub pending_pushes: usize,
}

/// JSON representation of a known peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerJson {
    pub id: String,
    pub address: String,
    pub status: PeerStatus,
    pub misbehavior_score: u64,
    /// Unix seconds of the last inbound message.
    pub last_seen: u64,
    pub last_active_round: u64,
    pub client_version: String,
}

impl From<PeerRecord> for PeerJson {
    fn from(rec: PeerRecord) -> Self {
        Self {
            id: rec.id.to_string(),
            address: rec.address,
            status: rec.status,
            misbehavior_score: rec.misbehavior_score,
            last_seen: rec.last_seen,
            last_active_round: rec.last_active_round,
            client_version: rec.client_version,
        }
    }
}

/// JSON representation of a ban record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationJson {
    pub peer: String,
    pub score: u64,
    /// Round in which the ban happened.
    pub round: u64,
    pub reason: String,
    pub banned_at: u64,
}

impl From<ReputationRecord> for ReputationJson {
    fn from(rec: ReputationRecord) -> Self {
        Self {
            peer: rec.peer.to_string(),
            score: rec.score,
            round: rec.round,
            reason: rec.reason,
            banned_at: rec.banned_at,
        }
    }
}

/// Create a JSON-RPC error.
fn rpc_error(code: i32, msg: &str) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(code, msg.to_string(), None::<()>)
}

/// Parse a peer id parameter.
pub fn parse_peer_id(raw: &str) -> Result<PeerId, ErrorObjectOwned> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(rpc_error(-1, "peer id must not be empty"));
    }
    Ok(PeerId::from(trimmed))
}

/// The BAR diagnostics JSON-RPC interface.
#[rpc(server)]
pub trait BarRpc {
    /// Returns a summary of the node and its peer collections.
    #[method(name = "getinfo")]
    async fn get_info(&self) -> Result<NodeInfoJson, ErrorObjectOwned>;

    /// Returns known peers, optionally filtered by status.
    #[method(name = "getpeers")]
    async fn get_peers(&self, status: Option<PeerStatus>) -> Result<Vec<PeerJson>, ErrorObjectOwned>;

    /// Returns the status of one peer.
    #[method(name = "getpeerstatus")]
    async fn get_peer_status(&self, peer: String) -> Result<PeerJson, ErrorObjectOwned>;

    /// Returns the gossip targets for a round (the current round if omitted).
    /// Read-only: the node's round is not changed.
    #[method(name = "selectpeers")]
    async fn select_peers(&self, round: Option<u64>) -> Result<Vec<String>, ErrorObjectOwned>;

    /// Returns retained ban records.
    #[method(name = "getreputation")]
    async fn get_reputation(&self) -> Result<Vec<ReputationJson>, ErrorObjectOwned>;
}

/// Implementation of the BAR JSON-RPC server.
pub struct RpcServerImpl {
    node: Arc<BarNode>,
}

impl RpcServerImpl {
    pub fn new(node: Arc<BarNode>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl BarRpcServer for RpcServerImpl {
    async fn get_info(&self) -> Result<NodeInfoJson, ErrorObjectOwned> {
        let node = &self.node;
        let blocks = node.chain_height().map_err(|e| rpc_error(-1, &e.to_string()))?;
        let (greylisted, whitelisted, banned) = node.controller().counts();
        let network = &node.config().network;
        Ok(NodeInfoJson {
            peer_id: node.local_peer_id().to_string(),
            network_id: network.network_id.clone(),
            client_version: network.client_version.clone(),
            round: node.controller().current_round(),
            blocks,
            greylisted,
            whitelisted,
            banned,
            connections: node.connection_count(),
            seed_node: node.inactivity().is_seed_node(),
            pending_handshakes: node.handshake().pending_count(),
            pending_pushes: node.push().pending_requests(),
        })
    }

    async fn get_peers(&self, status: Option<PeerStatus>) -> Result<Vec<PeerJson>, ErrorObjectOwned> {
        Ok(self
            .node
            .peers()
            .into_iter()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .map(PeerJson::from)
            .collect())
    }

    async fn get_peer_status(&self, peer: String) -> Result<PeerJson, ErrorObjectOwned> {
        let id = parse_peer_id(&peer)?;
        self.node
            .controller()
            .peer(&id)
            .map(PeerJson::from)
            .ok_or_else(|| rpc_error(-5, "peer not known"))
    }

    async fn select_peers(&self, round: Option<u64>) -> Result<Vec<String>, ErrorObjectOwned> {
        let round = round.unwrap_or_else(|| self.node.controller().current_round());
        Ok(self
            .node
            .preview_selection(round)
            .into_iter()
            .map(|p| p.to_string())
            .collect())
    }

    async fn get_reputation(&self) -> Result<Vec<ReputationJson>, ErrorObjectOwned> {
        Ok(self
            .node
            .reputation_records()
            .into_iter()
            .map(ReputationJson::from)
            .collect())
    }
}

/// Start the JSON-RPC server on the given address.
///
/// Returns a [`ServerHandle`] that can be used to stop the server.
pub async fn start_rpc_server(addr: &str, node: Arc<BarNode>) -> Result<ServerHandle, BarError> {
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| NetworkError::Setup(format!("RPC server error: {e}")))?;

    let rpc_impl = RpcServerImpl::new(node);
    let handle = server.start(rpc_impl.into_rpc());

    Ok(handle)
}
