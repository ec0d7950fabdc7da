//! Seed-node inactivity detection.
//!
//! Seed nodes probe every known peer on a fixed interval. A peer that has not
//! sent anything for `inactivity_timeout` is reported to the other seed nodes
//! (the whitelist) with an `inactivity_report`. Evidence accumulates per
//! suspected peer, and the peer is demoted once either
//!
//! - `seed_node_threshold` distinct reporters agree, or
//! - one reporter has filed `persistent_report_count` reports over more than
//!   `persistent_report_window`.
//!
//! Reports count only when they come from a whitelisted sender, so fresh
//! connections cannot vote a peer out.
//!
//! Non-seed nodes still record inbound reports so they can take over seed
//! duty without starting from scratch. Evidence that has not been refreshed
//! within `evidence_retention` is dropped.

use bar_core::constants::{MAX_EVIDENCE_ENTRIES, MAX_EVIDENCE_TAGS};
use bar_core::error::BarError;
use bar_core::traits::Transport;
use bar_core::types::{PeerId, PeerStatus, unix_now};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::admission::{
    PENALTY_MALFORMED_MESSAGE, PENALTY_SPOOFED_SENDER, PENALTY_UNAUTHORIZED_SEED_MESSAGE, PeerAdmissionController,
};
use crate::config::InactivityConfig;
use crate::protocol::{INACTIVITY_TOPIC, InactivityKind, InactivityMessage, WireMessage};

/// Accumulated reports against one peer.
#[derive(Debug, Clone)]
pub struct InactivityEvidence {
    pub first_reported: Instant,
    pub last_reported: Instant,
    pub report_count: u64,
    pub reporters: BTreeSet<PeerId>,
    pub reasons: Vec<String>,
    pub evidence: Vec<String>,
}

impl InactivityEvidence {
    fn new(now: Instant) -> Self {
        Self {
            first_reported: now,
            last_reported: now,
            report_count: 0,
            reporters: BTreeSet::new(),
            reasons: Vec::new(),
            evidence: Vec::new(),
        }
    }
}

/// Push onto a bounded list, dropping the oldest entries past `max`.
fn push_capped(list: &mut Vec<String>, item: String, max: usize) {
    list.push(item);
    if list.len() > max {
        let excess = list.len() - max;
        list.drain(..excess);
    }
}

/// Runs the inactivity protocol for one node.
pub struct InactivityCoordinator {
    local_id: PeerId,
    client_version: String,
    config: InactivityConfig,
    is_seed: AtomicBool,
    controller: Arc<PeerAdmissionController>,
    transport: Arc<dyn Transport>,
    evidence: RwLock<HashMap<PeerId, InactivityEvidence>>,
}

impl InactivityCoordinator {
    pub fn new(
        config: InactivityConfig,
        client_version: impl Into<String>,
        controller: Arc<PeerAdmissionController>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            local_id: transport.local_peer_id(),
            client_version: client_version.into(),
            is_seed: AtomicBool::new(config.is_seed_node),
            config,
            controller,
            transport,
            evidence: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_seed_node(&self) -> bool {
        self.is_seed.load(Ordering::Relaxed)
    }

    /// Turn active probing on or off.
    pub fn set_seed_node(&self, enabled: bool) {
        self.is_seed.store(enabled, Ordering::Relaxed);
        info!(enabled, "inactivity: seed node duty changed");
    }

    // ------------------------------------------------------------------
    // Evidence
    // ------------------------------------------------------------------

    pub fn record_evidence(&self, peer: &PeerId, reporter: &PeerId, reason: &str, evidence: &[String]) {
        self.record_evidence_at(peer, reporter, reason, evidence, Instant::now());
    }

    /// Add one report against `peer`. A reporter counts once towards the
    /// distinct-reporter quorum no matter how often it reports.
    pub fn record_evidence_at(
        &self,
        peer: &PeerId,
        reporter: &PeerId,
        reason: &str,
        evidence: &[String],
        now: Instant,
    ) {
        let mut table = self.evidence.write();
        let entry = table.entry(peer.clone()).or_insert_with(|| InactivityEvidence::new(now));
        entry.last_reported = now;
        entry.report_count = entry.report_count.saturating_add(1);
        entry.reporters.insert(reporter.clone());
        if !reason.is_empty() {
            push_capped(&mut entry.reasons, reason.to_string(), MAX_EVIDENCE_ENTRIES);
        }
        for tag in evidence {
            push_capped(&mut entry.evidence, tag.clone(), MAX_EVIDENCE_ENTRIES);
        }
        debug!(
            %peer,
            %reporter,
            reporters = entry.reporters.len(),
            reports = entry.report_count,
            "inactivity: evidence recorded"
        );
    }

    pub fn should_mark_inactive(&self, peer: &PeerId) -> bool {
        self.should_mark_inactive_at(peer, Instant::now())
    }

    /// Quorum of distinct reporters, or a persistent reporter.
    pub fn should_mark_inactive_at(&self, peer: &PeerId, now: Instant) -> bool {
        let table = self.evidence.read();
        let Some(ev) = table.get(peer) else {
            return false;
        };
        if ev.reporters.len() >= self.config.seed_node_threshold {
            return true;
        }
        ev.report_count >= self.config.persistent_report_count
            && now.saturating_duration_since(ev.first_reported) > self.config.persistent_report_window
    }

    pub fn evidence_for(&self, peer: &PeerId) -> Option<InactivityEvidence> {
        self.evidence.read().get(peer).cloned()
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence.read().len()
    }

    /// Drop evidence not refreshed within the retention window.
    pub fn prune_evidence(&self, now: Instant) -> usize {
        let retention = self.config.evidence_retention;
        let mut table = self.evidence.write();
        let before = table.len();
        table.retain(|_, ev| now.saturating_duration_since(ev.last_reported) <= retention);
        let pruned = before - table.len();
        if pruned > 0 {
            debug!(pruned, "inactivity: stale evidence pruned");
        }
        pruned
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Demote `peer`, broadcast the consolidated evidence and forget it.
    /// Returns whether a demotion happened.
    pub fn mark_inactive(&self, peer: &PeerId) -> bool {
        let Some(ev) = self.evidence.write().remove(peer) else {
            return false;
        };
        let demoted = self.controller.demote(peer);
        info!(
            %peer,
            demoted,
            reporters = ev.reporters.len(),
            reports = ev.report_count,
            "inactivity: peer marked inactive"
        );

        let mut tags: Vec<String> = ev.reporters.iter().map(|r| format!("reporter:{r}")).collect();
        tags.extend(ev.evidence.iter().cloned());
        tags.truncate(MAX_EVIDENCE_TAGS);
        let reason = format!(
            "{} distinct reporters, {} reports",
            ev.reporters.len(),
            ev.report_count
        );
        if let Err(e) = self.broadcast(InactivityKind::InactivityReport, peer, reason, tags) {
            warn!(%peer, error = %e, "inactivity: consolidated report not sent");
        }
        demoted
    }

    fn broadcast(
        &self,
        kind: InactivityKind,
        target: &PeerId,
        reason: String,
        evidence: Vec<String>,
    ) -> Result<(), BarError> {
        let msg = InactivityMessage {
            kind,
            from: self.local_id.clone(),
            to: PeerId::default(),
            target_peer: target.clone(),
            timestamp: unix_now(),
            client_version: self.client_version.clone(),
            reason,
            evidence,
        };
        self.transport.publish(INACTIVITY_TOPIC, msg.encode()?)?;
        Ok(())
    }

    /// Demote every peer whose evidence now satisfies the marking rule.
    pub fn evaluate(&self, now: Instant) -> Vec<PeerId> {
        let mut suspects: Vec<PeerId> = self.evidence.read().keys().cloned().collect();
        suspects.sort();
        let mut marked = Vec::new();
        for peer in suspects {
            if self.should_mark_inactive_at(&peer, now) {
                self.mark_inactive(&peer);
                marked.push(peer);
            }
        }
        marked
    }

    /// One probe tick. `now_unix` is compared against peers' `last_seen`.
    ///
    /// Returns the peers marked inactive during this tick. Non-seed nodes only
    /// prune evidence.
    pub fn probe_once(&self, now_unix: u64, now: Instant) -> Vec<PeerId> {
        self.prune_evidence(now);
        if !self.is_seed_node() {
            return Vec::new();
        }

        let timeout = self.config.inactivity_timeout.as_secs();
        for rec in self.controller.peers() {
            if rec.id == self.local_id || rec.status == PeerStatus::Banned {
                continue;
            }
            let silent_for = now_unix.saturating_sub(rec.last_seen);
            if silent_for <= timeout {
                continue;
            }
            let reason = format!("no messages for {silent_for}s");
            let tags = vec![format!("last_seen:{}", rec.last_seen), format!("status:{}", rec.status)];
            self.record_evidence_at(&rec.id, &self.local_id, &reason, &tags, now);
            debug!(peer = %rec.id, silent_for, "inactivity: peer looks inactive");
            if let Err(e) = self.broadcast(InactivityKind::InactivityReport, &rec.id, reason, tags) {
                warn!(peer = %rec.id, error = %e, "inactivity: report not sent");
            }
        }

        self.evaluate(now)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process a payload received on the inactivity topic from `origin`.
    pub fn handle(&self, origin: &PeerId, data: &[u8]) {
        let msg = match InactivityMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %origin, error = %e, "inactivity: malformed message");
                self.controller
                    .update_misbehavior_score(origin, PENALTY_MALFORMED_MESSAGE, "malformed inactivity message");
                return;
            }
        };
        if &msg.from != origin {
            warn!(peer = %origin, claimed = %msg.from, "inactivity: sender mismatch");
            self.controller
                .update_misbehavior_score(origin, PENALTY_SPOOFED_SENDER, "spoofed inactivity sender");
            return;
        }
        if msg.from == self.local_id || !msg.is_addressed_to(&self.local_id) {
            return;
        }
        if msg.target_peer == self.local_id {
            debug!(reporter = %msg.from, "inactivity: report about ourselves ignored");
            return;
        }

        match msg.kind {
            InactivityKind::MarkInactive => self.on_mark_inactive(msg),
            InactivityKind::InactivityReport => self.on_report(msg),
        }
    }

    fn on_mark_inactive(&self, msg: InactivityMessage) {
        if !self.controller.is_whitelisted(&msg.from) {
            warn!(peer = %msg.from, "inactivity: mark_inactive from non-seed peer");
            self.controller.update_misbehavior_score(
                &msg.from,
                PENALTY_UNAUTHORIZED_SEED_MESSAGE,
                "mark_inactive from non-seed peer",
            );
            return;
        }
        let demoted = self.controller.demote(&msg.target_peer);
        self.evidence.write().remove(&msg.target_peer);
        info!(suspect = %msg.target_peer, seed = %msg.from, demoted, "inactivity: mark_inactive applied");
    }

    fn on_report(&self, msg: InactivityMessage) {
        // Only seed nodes count toward the quorum.
        if !self.controller.is_whitelisted(&msg.from) {
            debug!(peer = %msg.from, suspect = %msg.target_peer, "inactivity: report from non-seed peer ignored");
            return;
        }
        match self.controller.peer_status(&msg.target_peer) {
            None | Some(PeerStatus::Banned) => {
                debug!(suspect = %msg.target_peer, "inactivity: report about unknown peer ignored");
                return;
            }
            Some(_) => {}
        }
        self.record_evidence(&msg.target_peer, &msg.from, &msg.reason, &msg.evidence);
    }

    // ------------------------------------------------------------------
    // Task
    // ------------------------------------------------------------------

    /// Probe loop. Exits when `shutdown` flips to `true` or its sender drops.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        // The first tick fires immediately; skip it so fresh peers get a grace period.
        ticker.tick().await;
        info!(
            seed = self.is_seed_node(),
            interval_secs = self.config.check_interval.as_secs(),
            "inactivity: probe loop started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let marked = self.probe_once(unix_now(), Instant::now());
                    if !marked.is_empty() {
                        info!(count = marked.len(), "inactivity: probe tick marked peers inactive");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("inactivity: probe loop stopped");
    }
}
