//! Optimistic chain-data push.
//!
//! When the admission controller promotes a peer, this node immediately sends
//! that peer a `push_request`. A whitelisted requester gets a `push_response`
//! with our latest block, or the last `header_window` headers if it declared
//! itself a light node. Requests from anyone else are dropped.
//!
//! Received chain data is checked structurally (payload commitment, declared
//! height, header linkage) before being handed to the [`BlockSink`]. Heights
//! we already store are skipped.

use bar_core::error::{BarError, ChainError};
use bar_core::traits::{BlockSink, ChainState, Transport};
use bar_core::types::{Block, BlockHeader, PeerId, PeerStatus, unix_now};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::admission::{
    PENALTY_INVALID_CHAIN_DATA, PENALTY_MALFORMED_MESSAGE, PENALTY_SPOOFED_SENDER, PENALTY_UNSOLICITED_RESPONSE,
    PeerAdmissionController,
};
use crate::config::PushConfig;
use crate::protocol::{PUSH_TOPIC, PushKind, PushMessage, WireMessage};

#[derive(Debug, Clone)]
struct PendingPush {
    peer: PeerId,
    sent_at: Instant,
}

/// Requests and serves chain data around promotion events.
pub struct OptimisticPushCoordinator {
    local_id: PeerId,
    client_version: String,
    config: PushConfig,
    controller: Arc<PeerAdmissionController>,
    transport: Arc<dyn Transport>,
    chain: Arc<dyn ChainState>,
    sink: Arc<dyn BlockSink>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingPush>>,
}

impl OptimisticPushCoordinator {
    pub fn new(
        config: PushConfig,
        client_version: impl Into<String>,
        controller: Arc<PeerAdmissionController>,
        transport: Arc<dyn Transport>,
        chain: Arc<dyn ChainState>,
        sink: Arc<dyn BlockSink>,
    ) -> Self {
        Self {
            local_id: transport.local_peer_id(),
            client_version: client_version.into(),
            config,
            controller,
            transport,
            chain,
            sink,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a status callback that forwards every Greylisted→Whitelisted
    /// transition on the returned channel.
    pub fn subscribe_promotions(controller: &PeerAdmissionController) -> mpsc::UnboundedReceiver<PeerId> {
        let (tx, rx) = mpsc::unbounded_channel();
        controller.on_status_change(Arc::new(move |peer, from, to| {
            if from == PeerStatus::Greylisted && to == PeerStatus::Whitelisted {
                let _ = tx.send(peer.clone());
            }
        }));
        rx
    }

    fn message(&self, kind: PushKind, to: &PeerId, request_id: u64) -> PushMessage {
        PushMessage {
            kind,
            from: self.local_id.clone(),
            to: to.clone(),
            request_id,
            timestamp: unix_now(),
            client_version: self.client_version.clone(),
            block_height: 0,
            block_data: None,
            block_headers: Vec::new(),
            is_light_node: self.config.light_node,
        }
    }

    fn send(&self, msg: &PushMessage) -> Result<(), BarError> {
        self.transport.publish(PUSH_TOPIC, msg.encode()?)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Ask `peer` for its latest chain data. Returns the request id.
    pub fn request_push(&self, peer: &PeerId) -> Result<u64, BarError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut msg = self.message(PushKind::PushRequest, peer, request_id);
        msg.block_height = self.chain.chain_height()?;
        self.pending.lock().insert(
            request_id,
            PendingPush {
                peer: peer.clone(),
                sent_at: Instant::now(),
            },
        );
        self.send(&msg)?;
        debug!(%peer, request_id, light = self.config.light_node, "push: request sent");
        Ok(request_id)
    }

    /// Called for each promotion event.
    pub fn on_promoted(&self, peer: &PeerId) {
        if let Err(e) = self.request_push(peer) {
            warn!(%peer, error = %e, "push: request after promotion failed");
        }
    }

    /// Offer our latest block to every whitelisted peer as `block_data`.
    pub fn announce_tip(&self) -> Result<(), BarError> {
        let height = self.chain.chain_height()?;
        let Some(block) = self.chain.block_at(height)? else {
            return Ok(());
        };
        let mut msg = self.message(PushKind::BlockData, &PeerId::default(), 0);
        msg.block_height = height;
        msg.block_data = Some(block);
        self.send(&msg)?;
        debug!(height, "push: tip announced");
        Ok(())
    }

    fn respond(&self, peer: &PeerId, request_id: u64, light: bool) -> Result<(), BarError> {
        let height = self.chain.chain_height()?;
        let mut msg = self.message(PushKind::PushResponse, peer, request_id);
        msg.block_height = height;
        if light {
            msg.block_headers = self.header_window(height)?;
        } else {
            msg.block_data = self.chain.block_at(height)?;
        }
        self.send(&msg)?;
        debug!(
            %peer,
            request_id,
            height,
            headers = msg.block_headers.len(),
            "push: response sent"
        );
        Ok(())
    }

    /// Headers for the last `header_window` heights ending at `tip`.
    fn header_window(&self, tip: u64) -> Result<Vec<BlockHeader>, ChainError> {
        let start = tip.saturating_sub(self.config.header_window.saturating_sub(1));
        let mut headers = Vec::new();
        for h in start..=tip {
            if let Some(header) = self.chain.header_at(h)? {
                headers.push(header);
            }
        }
        Ok(headers)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process a payload received on the push topic from `origin`.
    pub fn handle(&self, origin: &PeerId, data: &[u8]) {
        let msg = match PushMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %origin, error = %e, "push: malformed message");
                self.controller
                    .update_misbehavior_score(origin, PENALTY_MALFORMED_MESSAGE, "malformed push message");
                return;
            }
        };
        if &msg.from != origin {
            warn!(peer = %origin, claimed = %msg.from, "push: sender mismatch");
            self.controller
                .update_misbehavior_score(origin, PENALTY_SPOOFED_SENDER, "spoofed push sender");
            return;
        }
        if msg.from == self.local_id || !msg.is_addressed_to(&self.local_id) {
            return;
        }
        let peer = msg.from.clone();

        match msg.kind {
            PushKind::PushRequest => {
                if !self.controller.is_whitelisted(&peer) {
                    debug!(%peer, "push: request from untrusted peer ignored");
                    return;
                }
                if let Err(e) = self.respond(&peer, msg.request_id, msg.is_light_node) {
                    warn!(%peer, error = %e, "push: response failed");
                }
            }
            PushKind::PushResponse => {
                if !self.take_pending(&peer, msg.request_id) {
                    warn!(%peer, request_id = msg.request_id, "push: unsolicited response");
                    self.controller.update_misbehavior_score(
                        &peer,
                        PENALTY_UNSOLICITED_RESPONSE,
                        "unsolicited push response",
                    );
                    return;
                }
                self.ingest(&peer, msg);
            }
            PushKind::BlockData => {
                if !self.controller.is_whitelisted(&peer) {
                    debug!(%peer, "push: block data from untrusted peer ignored");
                    return;
                }
                self.ingest(&peer, msg);
            }
        }
    }

    /// Remove the pending request if it belongs to `peer` and is still live.
    fn take_pending(&self, peer: &PeerId, request_id: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.get(&request_id) {
            Some(p) if &p.peer == peer => {
                let live = p.sent_at.elapsed() <= self.config.push_timeout;
                pending.remove(&request_id);
                live
            }
            _ => false,
        }
    }

    /// Validate and import the chain data carried by `msg`. Returns the
    /// number of blocks or headers handed to the sink.
    pub fn ingest(&self, peer: &PeerId, msg: PushMessage) -> usize {
        let declared = msg.block_height;
        let mut imported = 0;

        if let Some(block) = msg.block_data {
            match self.ingest_block(block, declared) {
                Ok(n) => imported += n,
                Err(reason) => {
                    self.penalize_chain_data(peer, &reason);
                    return imported;
                }
            }
        }
        if !msg.block_headers.is_empty() {
            match self.ingest_headers(msg.block_headers, declared) {
                Ok(n) => imported += n,
                Err(reason) => self.penalize_chain_data(peer, &reason),
            }
        }
        if imported > 0 {
            info!(%peer, imported, declared, "push: chain data imported");
        }
        imported
    }

    fn penalize_chain_data(&self, peer: &PeerId, reason: &str) {
        warn!(%peer, reason, "push: invalid chain data");
        self.controller
            .update_misbehavior_score(peer, PENALTY_INVALID_CHAIN_DATA, "invalid chain data");
    }

    fn ingest_block(&self, block: Block, declared: u64) -> Result<usize, String> {
        if !block.verify_payload() {
            return Err("payload hash mismatch".into());
        }
        if block.height() > declared {
            return Err(format!("block height {} above declared {declared}", block.height()));
        }
        match self.chain.has_block(block.height()) {
            Ok(true) => return Ok(0),
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "push: chain lookup failed");
                return Ok(0);
            }
        }
        match self.sink.import_block(block) {
            Ok(()) => Ok(1),
            Err(ChainError::InvalidBlock(reason)) => Err(reason),
            Err(e) => {
                debug!(error = %e, "push: block not importable yet");
                Ok(0)
            }
        }
    }

    fn ingest_headers(&self, headers: Vec<BlockHeader>, declared: u64) -> Result<usize, String> {
        if headers.len() as u64 > self.config.header_window {
            return Err(format!("{} headers exceed window {}", headers.len(), self.config.header_window));
        }
        for pair in headers.windows(2) {
            if pair[0].height.checked_add(1) != Some(pair[1].height) || pair[1].prev_hash != pair[0].hash() {
                return Err(format!("header linkage broken at height {}", pair[1].height));
            }
        }
        if let Some(last) = headers.last() {
            if last.height > declared {
                return Err(format!("header height {} above declared {declared}", last.height));
            }
        }

        let mut fresh = Vec::with_capacity(headers.len());
        for header in headers {
            match self.chain.header_at(header.height) {
                Ok(Some(_)) => {}
                Ok(None) => fresh.push(header),
                Err(e) => {
                    warn!(error = %e, "push: chain lookup failed");
                    return Ok(0);
                }
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }
        match self.sink.import_headers(fresh) {
            Ok(n) => Ok(n),
            Err(ChainError::InvalidBlock(reason)) => Err(reason),
            Err(e) => {
                debug!(error = %e, "push: headers not importable yet");
                Ok(0)
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop requests that have waited longer than `push_timeout`.
    pub fn expire_requests(&self, now: Instant) -> usize {
        let timeout = self.config.push_timeout;
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|id, p| {
            let live = now.saturating_duration_since(p.sent_at) <= timeout;
            if !live {
                debug!(peer = %p.peer, request_id = *id, "push: request timed out");
            }
            live
        });
        before - pending.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// React to promotions and expire requests until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut promotions: mpsc::UnboundedReceiver<PeerId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.push_timeout);
        info!(light = self.config.light_node, "push: coordinator started");
        loop {
            tokio::select! {
                Some(peer) = promotions.recv() => self.on_promoted(&peer),
                _ = ticker.tick() => {
                    self.expire_requests(Instant::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("push: coordinator stopped");
    }
}
