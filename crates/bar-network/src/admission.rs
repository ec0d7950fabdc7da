//! Peer admission control.
//!
//! Every known peer lives in exactly one of three collections: greylisted
//! (probationary), whitelisted (trusted) or banned. Peers enter the greylist
//! when the host reports a new connection, are promoted after a successful
//! handshake, and move back down as their misbehaviour score grows:
//!
//! - a whitelisted peer whose score reaches `pom_threshold` is demoted;
//! - a greylisted peer whose score reaches `pom_ban_threshold` is banned.
//!
//! Scores never decrease. Bans are permanent for the life of the process and
//! leave a [`ReputationRecord`] behind that is purged after
//! `reputation_retention_rounds` rounds.
//!
//! [`PeerAdmissionController::select_peers`] picks gossip targets for a round
//! from the whitelist with a keyed, deterministic PRNG so an outside observer
//! cannot predict which peers a node will favour.

use bar_core::constants::SEED_LEN;
use bar_core::types::{PeerId, PeerRecord, PeerStatus, ReputationRecord, RoundSeed, unix_now};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AdmissionPolicy;

/// Penalty for a handshake carrying a stale or forged round seed.
pub const PENALTY_INVALID_ROUND_SEED: u64 = 1;
/// Penalty for a message that fails to decode or validate.
pub const PENALTY_MALFORMED_MESSAGE: u64 = 1;
/// Penalty for a message whose `from` field differs from the transport origin.
pub const PENALTY_SPOOFED_SENDER: u64 = 3;
/// Penalty for a seed-only message sent by a peer that is not a seed node.
pub const PENALTY_UNAUTHORIZED_SEED_MESSAGE: u64 = 2;
/// Penalty for a push response nobody asked for.
pub const PENALTY_UNSOLICITED_RESPONSE: u64 = 1;
/// Penalty for chain data that fails structural validation.
pub const PENALTY_INVALID_CHAIN_DATA: u64 = 3;

/// Reason recorded when a ban is caused by the score threshold.
pub const SCORE_BAN_REASON: &str = "score exceeded threshold";

/// Invoked with `(peer, old_status, new_status)` on every status transition.
pub type StatusCallback = Arc<dyn Fn(&PeerId, PeerStatus, PeerStatus) + Send + Sync>;

type Transition = (PeerId, PeerStatus, PeerStatus);

#[derive(Debug, Default)]
struct AdmissionState {
    greylist: HashMap<PeerId, PeerRecord>,
    whitelist: HashMap<PeerId, PeerRecord>,
    banned: HashMap<PeerId, PeerRecord>,
    reputation: HashMap<PeerId, ReputationRecord>,
    round: u64,
}

impl AdmissionState {
    fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.whitelist
            .get(id)
            .or_else(|| self.greylist.get(id))
            .or_else(|| self.banned.get(id))
    }

    fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerRecord> {
        if let Some(rec) = self.whitelist.get_mut(id) {
            return Some(rec);
        }
        if let Some(rec) = self.greylist.get_mut(id) {
            return Some(rec);
        }
        self.banned.get_mut(id)
    }

    fn contains(&self, id: &PeerId) -> bool {
        self.whitelist.contains_key(id) || self.greylist.contains_key(id) || self.banned.contains_key(id)
    }

    fn demote(&mut self, id: &PeerId) -> Option<Transition> {
        let mut rec = self.whitelist.remove(id)?;
        rec.status = PeerStatus::Greylisted;
        self.greylist.insert(id.clone(), rec);
        Some((id.clone(), PeerStatus::Whitelisted, PeerStatus::Greylisted))
    }

    fn ban(&mut self, id: &PeerId, reason: &str) -> Option<Transition> {
        let (mut rec, from) = if let Some(rec) = self.whitelist.remove(id) {
            (rec, PeerStatus::Whitelisted)
        } else if let Some(rec) = self.greylist.remove(id) {
            (rec, PeerStatus::Greylisted)
        } else {
            return None;
        };
        rec.status = PeerStatus::Banned;
        self.reputation.insert(
            id.clone(),
            ReputationRecord {
                peer: id.clone(),
                score: rec.misbehavior_score,
                round: self.round,
                reason: reason.to_string(),
                banned_at: unix_now(),
            },
        );
        self.banned.insert(id.clone(), rec);
        Some((id.clone(), from, PeerStatus::Banned))
    }
}

/// Owns the greylist, whitelist and banned collections plus reputation history.
///
/// All state sits behind a single lock. Status-change callbacks run after the
/// lock is released, so they may call back into the controller.
pub struct PeerAdmissionController {
    policy: AdmissionPolicy,
    base_seed: [u8; SEED_LEN],
    state: RwLock<AdmissionState>,
    callbacks: RwLock<Vec<StatusCallback>>,
}

impl PeerAdmissionController {
    /// Create a controller with a freshly generated selection secret.
    pub fn new(policy: AdmissionPolicy) -> Self {
        let mut base_seed = [0u8; SEED_LEN];
        rand::thread_rng().fill_bytes(&mut base_seed);
        Self::with_base_seed(policy, base_seed)
    }

    /// Create a controller with a fixed selection secret.
    pub fn with_base_seed(policy: AdmissionPolicy, base_seed: [u8; SEED_LEN]) -> Self {
        Self {
            policy,
            base_seed,
            state: RwLock::new(AdmissionState::default()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Register a callback fired on every status transition.
    pub fn on_status_change(&self, callback: StatusCallback) {
        self.callbacks.write().push(callback);
    }

    fn notify(&self, transitions: Vec<Transition>) {
        if transitions.is_empty() {
            return;
        }
        let callbacks = self.callbacks.read().clone();
        for (peer, from, to) in transitions {
            for cb in &callbacks {
                cb(&peer, from, to);
            }
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Start tracking a newly connected peer as greylisted.
    ///
    /// Returns `false` if the id is already known in any collection.
    pub fn add_peer(&self, id: &PeerId, address: &str) -> bool {
        let mut state = self.state.write();
        if state.contains(id) {
            debug!(peer = %id, "admission: peer already known");
            return false;
        }
        state
            .greylist
            .insert(id.clone(), PeerRecord::new(id.clone(), address, unix_now()));
        info!(peer = %id, address, "admission: peer greylisted");
        true
    }

    /// Move a greylisted peer to the whitelist.
    ///
    /// Fails if the peer is not greylisted or the whitelist is full.
    pub fn promote(&self, id: &PeerId) -> bool {
        let transition = {
            let mut state = self.state.write();
            if !state.greylist.contains_key(id) {
                debug!(peer = %id, "admission: promote skipped, peer not greylisted");
                return false;
            }
            if state.whitelist.len() >= self.policy.whitelist_capacity {
                debug!(
                    peer = %id,
                    capacity = self.policy.whitelist_capacity,
                    "admission: promote failed, whitelist full"
                );
                return false;
            }
            let Some(mut rec) = state.greylist.remove(id) else {
                return false;
            };
            rec.status = PeerStatus::Whitelisted;
            rec.last_handshake = Some(unix_now());
            info!(peer = %id, score = rec.misbehavior_score, "admission: peer promoted");
            state.whitelist.insert(id.clone(), rec);
            (id.clone(), PeerStatus::Greylisted, PeerStatus::Whitelisted)
        };
        self.notify(vec![transition]);
        true
    }

    /// Move a whitelisted peer back to the greylist, keeping its score.
    pub fn demote(&self, id: &PeerId) -> bool {
        let transition = self.state.write().demote(id);
        match transition {
            Some(t) => {
                info!(peer = %id, "admission: peer demoted");
                self.notify(vec![t]);
                true
            }
            None => {
                debug!(peer = %id, "admission: demote skipped, peer not whitelisted");
                false
            }
        }
    }

    /// Ban a greylisted or whitelisted peer and snapshot its reputation.
    ///
    /// No-op for unknown or already banned peers.
    pub fn ban(&self, id: &PeerId, reason: &str) -> bool {
        let transition = self.state.write().ban(id, reason);
        match transition {
            Some(t) => {
                warn!(peer = %id, reason, "admission: peer banned");
                self.notify(vec![t]);
                true
            }
            None => {
                debug!(peer = %id, "admission: ban skipped, peer unknown or already banned");
                false
            }
        }
    }

    /// Add `delta` to a peer's misbehaviour score and apply the thresholds.
    ///
    /// A whitelisted peer at or above `pom_threshold` is demoted; otherwise a
    /// greylisted peer at or above `pom_ban_threshold` is banned. At most one
    /// of the two happens per call. Returns the peer's resulting status, or
    /// `None` if the peer is unknown or already banned.
    pub fn update_misbehavior_score(&self, id: &PeerId, delta: u64, reason: &str) -> Option<PeerStatus> {
        let (status, transition) = {
            let mut state = self.state.write();
            let (status, score) = if let Some(rec) = state.whitelist.get_mut(id) {
                rec.misbehavior_score = rec.misbehavior_score.saturating_add(delta);
                (PeerStatus::Whitelisted, rec.misbehavior_score)
            } else if let Some(rec) = state.greylist.get_mut(id) {
                rec.misbehavior_score = rec.misbehavior_score.saturating_add(delta);
                (PeerStatus::Greylisted, rec.misbehavior_score)
            } else {
                debug!(peer = %id, reason, "admission: score update skipped, peer unknown or banned");
                return None;
            };
            debug!(peer = %id, score, delta, reason, "admission: misbehaviour recorded");

            match status {
                PeerStatus::Whitelisted if score >= self.policy.pom_threshold => {
                    warn!(peer = %id, score, reason, "admission: score over demotion threshold");
                    (PeerStatus::Greylisted, state.demote(id))
                }
                PeerStatus::Greylisted if score >= self.policy.pom_ban_threshold => {
                    warn!(peer = %id, score, reason, "admission: score over ban threshold, peer banned");
                    (PeerStatus::Banned, state.ban(id, SCORE_BAN_REASON))
                }
                _ => (status, None),
            }
        };
        self.notify(transition.into_iter().collect());
        Some(status)
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Refresh `last_seen` for a peer, and its last active round when given.
    pub fn record_activity(&self, id: &PeerId, round: Option<u64>) {
        self.record_activity_at(id, unix_now(), round);
    }

    /// [`record_activity`](Self::record_activity) with an explicit timestamp.
    pub fn record_activity_at(&self, id: &PeerId, now: u64, round: Option<u64>) {
        let mut state = self.state.write();
        if let Some(rec) = state.get_mut(id) {
            rec.last_seen = now;
            if let Some(r) = round {
                rec.last_active_round = rec.last_active_round.max(r);
            }
        }
    }

    /// Store the client version a peer reported during its handshake.
    pub fn set_client_version(&self, id: &PeerId, version: &str) {
        if let Some(rec) = self.state.write().get_mut(id) {
            rec.client_version = version.to_string();
        }
    }

    /// Advance the controller's notion of the current round.
    pub fn set_round(&self, round: u64) {
        self.state.write().round = round;
    }

    pub fn current_round(&self) -> u64 {
        self.state.read().round
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// The selection seed for `round`, keyed by this node's private secret.
    pub fn round_seed(&self, round: u64) -> RoundSeed {
        RoundSeed::derive(&self.base_seed, round)
    }

    /// Choose up to `whitelist_capacity` whitelisted peers for `round`.
    ///
    /// The whitelist is sorted by peer id before indexing, so the result only
    /// depends on the whitelist contents, the secret and the round. The
    /// controller's round moves forward to `round` but never back.
    pub fn select_peers(&self, round: u64) -> Vec<PeerId> {
        let mut state = self.state.write();
        state.round = state.round.max(round);
        let selected = self.select_from(&state.whitelist, round);
        debug!(round, selected = selected.len(), "admission: peers selected");
        selected
    }

    /// The selection [`select_peers`](Self::select_peers) would make for
    /// `round`, without touching the controller's round.
    pub fn preview_selection(&self, round: u64) -> Vec<PeerId> {
        let state = self.state.read();
        self.select_from(&state.whitelist, round)
    }

    fn select_from(&self, whitelist: &HashMap<PeerId, PeerRecord>, round: u64) -> Vec<PeerId> {
        let mut candidates: Vec<&PeerId> = whitelist.keys().collect();
        candidates.sort();
        let count = self.policy.whitelist_capacity.min(candidates.len());
        let seed = self.round_seed(round);

        select_indices(&seed, candidates.len(), count)
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Reputation
    // ------------------------------------------------------------------

    /// Drop reputation records older than the retention window. Returns the
    /// number purged.
    pub fn cleanup_reputation_records(&self) -> usize {
        let mut state = self.state.write();
        let round = state.round;
        let window = self.policy.reputation_retention_rounds;
        let before = state.reputation.len();
        state
            .reputation
            .retain(|_, rec| round.saturating_sub(rec.round) <= window);
        let purged = before - state.reputation.len();
        if purged > 0 {
            info!(purged, round, "admission: reputation records purged");
        }
        purged
    }

    pub fn reputation_record(&self, id: &PeerId) -> Option<ReputationRecord> {
        self.state.read().reputation.get(id).cloned()
    }

    /// All retained reputation records, sorted by peer id.
    pub fn reputation_records(&self) -> Vec<ReputationRecord> {
        let mut records: Vec<_> = self.state.read().reputation.values().cloned().collect();
        records.sort_by(|a, b| a.peer.cmp(&b.peer));
        records
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn peer_status(&self, id: &PeerId) -> Option<PeerStatus> {
        self.state.read().get(id).map(|r| r.status)
    }

    pub fn peer(&self, id: &PeerId) -> Option<PeerRecord> {
        self.state.read().get(id).cloned()
    }

    pub fn is_whitelisted(&self, id: &PeerId) -> bool {
        self.state.read().whitelist.contains_key(id)
    }

    pub fn is_banned(&self, id: &PeerId) -> bool {
        self.state.read().banned.contains_key(id)
    }

    pub fn whitelisted(&self) -> Vec<PeerId> {
        sorted_ids(&self.state.read().whitelist)
    }

    pub fn greylisted(&self) -> Vec<PeerId> {
        sorted_ids(&self.state.read().greylist)
    }

    pub fn banned(&self) -> Vec<PeerId> {
        sorted_ids(&self.state.read().banned)
    }

    /// Every record the controller holds, sorted by peer id.
    pub fn peers(&self) -> Vec<PeerRecord> {
        let state = self.state.read();
        let mut all: Vec<PeerRecord> = state
            .whitelist
            .values()
            .chain(state.greylist.values())
            .chain(state.banned.values())
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// `(greylisted, whitelisted, banned)` collection sizes.
    pub fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.read();
        (state.greylist.len(), state.whitelist.len(), state.banned.len())
    }
}

fn sorted_ids(map: &HashMap<PeerId, PeerRecord>) -> Vec<PeerId> {
    let mut ids: Vec<PeerId> = map.keys().cloned().collect();
    ids.sort();
    ids
}

/// Pick `count` distinct indices in `0..n`.
///
/// Draw `i` is `u32(SHA-256(seed ‖ bigEndian64(i))[..4]) mod n`; a draw that
/// hits an index already taken probes forward, wrapping, to the next free one.
pub fn select_indices(seed: &RoundSeed, n: usize, count: usize) -> Vec<usize> {
    let count = count.min(n);
    let mut taken = vec![false; n];
    let mut picked = Vec::with_capacity(count);

    for i in 0..count as u64 {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(i.to_be_bytes());
        let digest = hasher.finalize();
        let draw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

        let mut idx = draw as usize % n;
        while taken[idx] {
            idx = (idx + 1) % n;
        }
        taken[idx] = true;
        picked.push(idx);
    }
    picked
}
