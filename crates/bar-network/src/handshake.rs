//! Round-synchronised ping/pong/ack handshake.
//!
//! ```text
//!   A (initiator)                 B (responder)
//!     ── ping(round, seed) ──────▶  verify seed
//!     ◀──────── pong(round, seed) ─  remember A awaits ack
//!   verify seed, send ack,
//!   promote B
//!     ── ack(round, seed) ───────▶  verify seed, promote A
//! ```
//!
//! Round seeds are derived from a network-wide key so every honest node can
//! recompute them. A seed that does not match, or whose round is more than
//! [`ROUND_SEED_TOLERANCE`] away from the local round, is scored against the
//! sender. Nonces let receivers drop duplicated or reordered messages.

use bar_core::constants::{ROUND_SEED_TOLERANCE, SEED_LEN};
use bar_core::error::BarError;
use bar_core::traits::Transport;
use bar_core::types::{PeerId, PeerStatus, RoundSeed, unix_now};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::admission::{
    PENALTY_INVALID_ROUND_SEED, PENALTY_MALFORMED_MESSAGE, PENALTY_SPOOFED_SENDER, PeerAdmissionController,
};
use crate::config::NetworkConfig;
use crate::protocol::{HANDSHAKE_TOPIC, HandshakeKind, HandshakeMessage, WireMessage};

/// Drives the handshake and promotes peers that complete it.
pub struct HandshakeCoordinator {
    local_id: PeerId,
    local_addr: String,
    client_version: String,
    handshake_key: [u8; SEED_LEN],
    timeout: Duration,
    controller: Arc<PeerAdmissionController>,
    transport: Arc<dyn Transport>,
    round: RwLock<(u64, RoundSeed)>,
    last_completed_round: AtomicU64,
    nonce: AtomicU64,
    /// Pings we sent, waiting for a pong.
    pending: Mutex<HashMap<PeerId, Instant>>,
    /// Pongs we sent, waiting for an ack.
    awaiting_ack: Mutex<HashMap<PeerId, Instant>>,
    last_nonce: Mutex<HashMap<PeerId, u64>>,
    /// Peers that completed the handshake while the whitelist was full.
    deferred: Mutex<HashSet<PeerId>>,
}

impl HandshakeCoordinator {
    pub fn new(
        config: &NetworkConfig,
        local_addr: impl Into<String>,
        controller: Arc<PeerAdmissionController>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let handshake_key = config.handshake_key();
        let start_nonce = chrono::Utc::now().timestamp_micros().max(0) as u64;
        Self {
            local_id: transport.local_peer_id(),
            local_addr: local_addr.into(),
            client_version: config.client_version.clone(),
            handshake_key,
            timeout: config.policy.handshake_timeout,
            controller,
            transport,
            round: RwLock::new((0, RoundSeed::derive(&handshake_key, 0))),
            last_completed_round: AtomicU64::new(0),
            nonce: AtomicU64::new(start_nonce),
            pending: Mutex::new(HashMap::new()),
            awaiting_ack: Mutex::new(HashMap::new()),
            last_nonce: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashSet::new()),
        }
    }

    // ------------------------------------------------------------------
    // Round state
    // ------------------------------------------------------------------

    /// Move to `round` and recompute the seed advertised in handshakes.
    pub fn update_round(&self, round: u64) {
        let seed = RoundSeed::derive(&self.handshake_key, round);
        *self.round.write() = (round, seed);
        debug!(round, "handshake: round advanced");
    }

    pub fn current_round(&self) -> (u64, RoundSeed) {
        *self.round.read()
    }

    /// Check that `seed` is the handshake seed for `round` and that `round`
    /// is close enough to the local round. Empty and mis-sized seeds fail.
    pub fn verify_round_seed(&self, round: u64, seed: &[u8]) -> bool {
        if seed.len() != SEED_LEN {
            return false;
        }
        let (current, _) = self.current_round();
        if current.abs_diff(round) > ROUND_SEED_TOLERANCE {
            return false;
        }
        RoundSeed::derive(&self.handshake_key, round).as_bytes().as_slice() == seed
    }

    /// A value strictly greater than every value previously returned.
    pub fn generate_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn build(&self, kind: HandshakeKind, to: &PeerId, addr_received: String) -> HandshakeMessage {
        let (round, seed) = self.current_round();
        HandshakeMessage {
            kind,
            from: self.local_id.clone(),
            to: to.clone(),
            round,
            round_seed: seed.to_hex(),
            timestamp: unix_now(),
            client_version: self.client_version.clone(),
            addr_received,
            addr_from: self.local_addr.clone(),
            last_round: self.last_completed_round.load(Ordering::Relaxed),
            nonce: self.generate_nonce(),
        }
    }

    fn send(&self, msg: &HandshakeMessage) -> Result<(), BarError> {
        let data = msg.encode()?;
        self.transport.publish(HANDSHAKE_TOPIC, data)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Protocol
    // ------------------------------------------------------------------

    /// Open a handshake with a newly connected peer.
    pub fn initiate(&self, peer: &PeerId, observed_addr: &str) -> Result<(), BarError> {
        if self.controller.is_banned(peer) {
            debug!(%peer, "handshake: not initiating with banned peer");
            return Ok(());
        }
        let msg = self.build(HandshakeKind::Ping, peer, observed_addr.to_string());
        self.pending.lock().insert(peer.clone(), Instant::now());
        self.send(&msg)?;
        debug!(%peer, round = msg.round, "handshake: ping sent");
        Ok(())
    }

    /// Process a payload received on the handshake topic from `origin`.
    ///
    /// Violations are scored against the sender; nothing is returned.
    pub fn handle(&self, origin: &PeerId, data: &[u8]) {
        let msg = match HandshakeMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %origin, error = %e, "handshake: malformed message");
                self.controller
                    .update_misbehavior_score(origin, PENALTY_MALFORMED_MESSAGE, "malformed handshake");
                return;
            }
        };
        if &msg.from != origin {
            warn!(peer = %origin, claimed = %msg.from, "handshake: sender mismatch");
            self.controller
                .update_misbehavior_score(origin, PENALTY_SPOOFED_SENDER, "spoofed handshake sender");
            return;
        }
        if msg.from == self.local_id || !msg.is_addressed_to(&self.local_id) {
            return;
        }

        let peer = msg.from.clone();
        if !self.accept_nonce(&peer, msg.nonce) {
            debug!(%peer, nonce = msg.nonce, "handshake: stale nonce dropped");
            return;
        }

        match self.controller.peer_status(&peer) {
            Some(PeerStatus::Banned) => return,
            Some(_) => {}
            None => {
                self.controller.add_peer(&peer, &msg.addr_from);
            }
        }

        let seed = hex::decode(&msg.round_seed).unwrap_or_default();
        if !self.verify_round_seed(msg.round, &seed) {
            warn!(%peer, round = msg.round, kind = ?msg.kind, "handshake: invalid round seed");
            self.controller
                .update_misbehavior_score(&peer, PENALTY_INVALID_ROUND_SEED, "invalid round seed");
            return;
        }
        self.controller.record_activity(&peer, Some(msg.round));
        self.controller.set_client_version(&peer, &msg.client_version);

        let result = match msg.kind {
            HandshakeKind::Ping => self.on_ping(&peer, &msg),
            HandshakeKind::Pong => self.on_pong(&peer),
            HandshakeKind::Ack => {
                self.on_ack(&peer);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(%peer, error = %e, "handshake: reply failed");
        }
    }

    fn accept_nonce(&self, peer: &PeerId, nonce: u64) -> bool {
        let mut seen = self.last_nonce.lock();
        match seen.get(peer) {
            Some(&last) if nonce <= last => false,
            _ => {
                seen.insert(peer.clone(), nonce);
                true
            }
        }
    }

    fn on_ping(&self, peer: &PeerId, ping: &HandshakeMessage) -> Result<(), BarError> {
        let observed = self
            .controller
            .peer(peer)
            .map(|r| r.address)
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| ping.addr_from.clone());
        let pong = self.build(HandshakeKind::Pong, peer, observed);
        self.awaiting_ack.lock().insert(peer.clone(), Instant::now());
        self.send(&pong)?;
        debug!(%peer, "handshake: pong sent");
        Ok(())
    }

    fn on_pong(&self, peer: &PeerId) -> Result<(), BarError> {
        let Some(sent) = self.pending.lock().remove(peer) else {
            debug!(%peer, "handshake: pong without pending ping ignored");
            return Ok(());
        };
        if sent.elapsed() > self.timeout {
            debug!(%peer, "handshake: late pong ignored");
            return Ok(());
        }
        let ack = self.build(HandshakeKind::Ack, peer, String::new());
        self.send(&ack)?;
        self.complete(peer);
        Ok(())
    }

    fn on_ack(&self, peer: &PeerId) {
        let Some(sent) = self.awaiting_ack.lock().remove(peer) else {
            debug!(%peer, "handshake: ack without pending pong ignored");
            return;
        };
        if sent.elapsed() > self.timeout {
            debug!(%peer, "handshake: late ack ignored");
            return;
        }
        self.complete(peer);
    }

    fn complete(&self, peer: &PeerId) {
        let (round, _) = self.current_round();
        self.last_completed_round.store(round, Ordering::Relaxed);
        if self.controller.promote(peer) {
            info!(%peer, round, "handshake: completed, peer promoted");
            self.deferred.lock().remove(peer);
        } else if self.controller.peer_status(peer) == Some(PeerStatus::Greylisted) {
            info!(%peer, "handshake: completed, whitelist full, promotion deferred");
            self.deferred.lock().insert(peer.clone());
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop pending pings and pongs older than the handshake timeout.
    /// Returns the number of expired entries.
    pub fn expire_stale(&self, now: Instant) -> usize {
        let timeout = self.timeout;
        let live = |sent: &mut Instant| now.saturating_duration_since(*sent) <= timeout;
        let mut expired = 0;
        for table in [&self.pending, &self.awaiting_ack] {
            let mut table = table.lock();
            let before = table.len();
            table.retain(|_, sent| live(sent));
            expired += before - table.len();
        }
        if expired > 0 {
            debug!(expired, "handshake: stale handshakes expired");
        }
        expired
    }

    /// Retry promotion of peers whose handshake completed while the
    /// whitelist was full. Returns the number promoted.
    pub fn retry_deferred(&self) -> usize {
        let candidates: Vec<PeerId> = self.deferred.lock().iter().cloned().collect();
        let mut promoted = 0;
        for peer in candidates {
            if self.controller.peer_status(&peer) != Some(PeerStatus::Greylisted) {
                self.deferred.lock().remove(&peer);
                continue;
            }
            if self.controller.promote(&peer) {
                info!(%peer, "handshake: deferred promotion succeeded");
                self.deferred.lock().remove(&peer);
                promoted += 1;
            }
        }
        promoted
    }

    /// Forget in-flight handshake state for a disconnected peer.
    pub fn forget(&self, peer: &PeerId) {
        self.pending.lock().remove(peer);
        self.awaiting_ack.lock().remove(peer);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len() + self.awaiting_ack.lock().len()
    }

    pub fn deferred_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.deferred.lock().iter().cloned().collect();
        peers.sort();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionPolicy;
    use crate::memory::{MemoryHub, MemoryTransport};
    use bar_core::traits::TransportEvent;
    use tokio::sync::broadcast;

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    struct Side {
        id: PeerId,
        controller: Arc<PeerAdmissionController>,
        coord: HandshakeCoordinator,
        transport: Arc<MemoryTransport>,
        rx: broadcast::Receiver<TransportEvent>,
    }

    fn side(hub: &Arc<MemoryHub>, name: &str, policy: AdmissionPolicy) -> Side {
        let (transport, rx) = hub.endpoint(name, format!("mem/{name}"));
        transport.join_topic(HANDSHAKE_TOPIC).unwrap();
        let config = NetworkConfig {
            policy: policy.clone(),
            ..NetworkConfig::default()
        };
        let controller = Arc::new(PeerAdmissionController::new(policy));
        let coord = HandshakeCoordinator::new(
            &config,
            format!("mem/{name}"),
            controller.clone(),
            transport.clone(),
        );
        coord.update_round(10);
        Side {
            id: PeerId::from(name),
            controller,
            coord,
            transport,
            rx,
        }
    }

    /// Deliver every queued event to its coordinator. Returns the number of
    /// handshake messages handled.
    fn pump(side: &mut Side) -> usize {
        let mut handled = 0;
        while let Ok(ev) = side.rx.try_recv() {
            match ev {
                TransportEvent::PeerConnected { peer, address } => {
                    side.controller.add_peer(&peer, &address);
                }
                TransportEvent::Message { topic, data, from } if topic == HANDSHAKE_TOPIC => {
                    side.coord.handle(&from, &data);
                    handled += 1;
                }
                _ => {}
            }
        }
        handled
    }

    fn settle(a: &mut Side, b: &mut Side) {
        while pump(a) + pump(b) > 0 {}
    }

    fn pair() -> (Arc<MemoryHub>, Side, Side) {
        let hub = MemoryHub::new();
        let mut a = side(&hub, "a", AdmissionPolicy::default());
        let mut b = side(&hub, "b", AdmissionPolicy::default());
        a.transport.connect("mem/b").unwrap();
        pump(&mut a);
        pump(&mut b);
        (hub, a, b)
    }

    fn message(side: &Side, kind: HandshakeKind, round: u64, seed: String, nonce: u64) -> Vec<u8> {
        HandshakeMessage {
            kind,
            from: side.id.clone(),
            to: PeerId::default(),
            round,
            round_seed: seed,
            timestamp: unix_now(),
            client_version: "test".into(),
            addr_received: String::new(),
            addr_from: String::new(),
            last_round: 0,
            nonce,
        }
        .encode()
        .unwrap()
    }

    // -------------------------------------------------------------------------
    // Round seeds and nonces
    // -------------------------------------------------------------------------

    #[test]
    fn seed_verification() {
        let (_hub, a, _b) = pair();
        let (round, seed) = a.coord.current_round();
        assert!(a.coord.verify_round_seed(round, seed.as_bytes()));
        assert!(!a.coord.verify_round_seed(round, &[]));
        assert!(!a.coord.verify_round_seed(round, &[0u8; SEED_LEN]));
        assert!(!a.coord.verify_round_seed(round + 1, seed.as_bytes()));
    }

    #[test]
    fn seed_tolerance_window() {
        let (_hub, a, _b) = pair();
        let key = NetworkConfig::default().handshake_key();
        let near = RoundSeed::derive(&key, 12);
        let far = RoundSeed::derive(&key, 13);
        assert!(a.coord.verify_round_seed(12, near.as_bytes()));
        assert!(!a.coord.verify_round_seed(13, far.as_bytes()));
    }

    #[test]
    fn nonces_strictly_increase() {
        let (_hub, a, _b) = pair();
        let mut last = a.coord.generate_nonce();
        for _ in 0..100 {
            let next = a.coord.generate_nonce();
            assert!(next > last);
            last = next;
        }
    }

    // -------------------------------------------------------------------------
    // Exchange
    // -------------------------------------------------------------------------

    #[test]
    fn three_way_handshake_promotes_both_sides() {
        let (_hub, mut a, mut b) = pair();
        a.coord.initiate(&b.id, "mem/b").unwrap();
        settle(&mut a, &mut b);

        assert_eq!(a.controller.peer_status(&b.id), Some(PeerStatus::Whitelisted));
        assert_eq!(b.controller.peer_status(&a.id), Some(PeerStatus::Whitelisted));
        assert_eq!(a.controller.peer(&b.id).unwrap().client_version, NetworkConfig::default().client_version);
        assert_eq!(a.coord.pending_count(), 0);
        assert_eq!(b.coord.pending_count(), 0);
    }

    #[test]
    fn crossed_pings_complete() {
        let (_hub, mut a, mut b) = pair();
        a.coord.initiate(&b.id, "mem/b").unwrap();
        b.coord.initiate(&a.id, "mem/a").unwrap();
        settle(&mut a, &mut b);

        assert!(a.controller.is_whitelisted(&b.id));
        assert!(b.controller.is_whitelisted(&a.id));
        assert_eq!(a.controller.peer(&b.id).unwrap().misbehavior_score, 0);
        assert_eq!(b.controller.peer(&a.id).unwrap().misbehavior_score, 0);
    }

    #[test]
    fn invalid_seed_is_scored_not_promoted() {
        let (_hub, a, b) = pair();
        let data = message(&a, HandshakeKind::Ping, 10, "00".repeat(32), 1);
        b.coord.handle(&a.id, &data);
        let rec = b.controller.peer(&a.id).unwrap();
        assert_eq!(rec.misbehavior_score, PENALTY_INVALID_ROUND_SEED);
        assert_eq!(rec.status, PeerStatus::Greylisted);
    }

    #[test]
    fn empty_seed_is_scored() {
        let (_hub, a, b) = pair();
        b.coord.handle(&a.id, &message(&a, HandshakeKind::Ping, 10, String::new(), 1));
        assert_eq!(b.controller.peer(&a.id).unwrap().misbehavior_score, PENALTY_INVALID_ROUND_SEED);
    }

    #[test]
    fn spoofed_sender_scored_against_origin() {
        let (_hub, a, b) = pair();
        let (_, seed) = a.coord.current_round();
        let data = message(&a, HandshakeKind::Ping, 10, seed.to_hex(), 1);
        let mallory = PeerId::from("mallory");
        b.controller.add_peer(&mallory, "mem/mallory");
        b.coord.handle(&mallory, &data);
        assert_eq!(b.controller.peer(&mallory).unwrap().misbehavior_score, PENALTY_SPOOFED_SENDER);
        assert_eq!(b.controller.peer(&a.id).unwrap().misbehavior_score, 0);
    }

    #[test]
    fn malformed_payload_scored() {
        let (_hub, a, b) = pair();
        b.coord.handle(&a.id, b"{not json");
        assert_eq!(b.controller.peer(&a.id).unwrap().misbehavior_score, PENALTY_MALFORMED_MESSAGE);
    }

    #[test]
    fn replayed_nonce_dropped() {
        let (_hub, mut a, b) = pair();
        let (_, seed) = a.coord.current_round();
        let data = message(&a, HandshakeKind::Ping, 10, seed.to_hex(), 5);
        b.coord.handle(&a.id, &data);
        b.coord.handle(&a.id, &data);
        // One pong only.
        let pongs = std::iter::from_fn(|| a.rx.try_recv().ok())
            .filter(|ev| matches!(ev, TransportEvent::Message { .. }))
            .count();
        assert_eq!(pongs, 1);
    }

    #[test]
    fn unsolicited_pong_and_ack_ignored() {
        let (_hub, a, b) = pair();
        let (_, seed) = a.coord.current_round();
        b.coord.handle(&a.id, &message(&a, HandshakeKind::Pong, 10, seed.to_hex(), 1));
        b.coord.handle(&a.id, &message(&a, HandshakeKind::Ack, 10, seed.to_hex(), 2));
        let rec = b.controller.peer(&a.id).unwrap();
        assert_eq!(rec.status, PeerStatus::Greylisted);
        assert_eq!(rec.misbehavior_score, 0);
    }

    #[test]
    fn expired_ping_not_completed() {
        let (_hub, mut a, mut b) = pair();
        a.coord.initiate(&b.id, "mem/b").unwrap();
        let later = Instant::now() + a.coord.timeout + Duration::from_secs(1);
        assert_eq!(a.coord.expire_stale(later), 1);
        settle(&mut a, &mut b);
        assert!(!a.controller.is_whitelisted(&b.id));
        // B answered the ping but never got an ack.
        assert!(!b.controller.is_whitelisted(&a.id));
        assert_eq!(b.coord.pending_count(), 1);
    }

    #[test]
    fn message_for_other_recipient_ignored() {
        let (_hub, a, b) = pair();
        let (_, seed) = a.coord.current_round();
        let mut msg = HandshakeMessage::decode(&message(&a, HandshakeKind::Ping, 10, seed.to_hex(), 1)).unwrap();
        msg.to = PeerId::from("carol");
        b.coord.handle(&a.id, &msg.encode().unwrap());
        assert_eq!(b.coord.pending_count(), 0);
    }

    #[test]
    fn full_whitelist_defers_promotion() {
        let hub = MemoryHub::new();
        let policy = AdmissionPolicy {
            whitelist_capacity: 1,
            ..AdmissionPolicy::default()
        };
        let mut a = side(&hub, "a", policy);
        let mut b = side(&hub, "b", AdmissionPolicy::default());
        a.transport.connect("mem/b").unwrap();
        settle(&mut a, &mut b);

        let filler = PeerId::from("filler");
        a.controller.add_peer(&filler, "x");
        assert!(a.controller.promote(&filler));

        a.coord.initiate(&b.id, "mem/b").unwrap();
        settle(&mut a, &mut b);
        assert_eq!(a.controller.peer_status(&b.id), Some(PeerStatus::Greylisted));
        assert_eq!(a.coord.deferred_peers(), vec![b.id.clone()]);
        assert_eq!(a.coord.retry_deferred(), 0);

        a.controller.demote(&filler);
        assert_eq!(a.coord.retry_deferred(), 1);
        assert!(a.controller.is_whitelisted(&b.id));
        assert!(a.coord.deferred_peers().is_empty());
    }
}
