//! Core data model: peers, reputation snapshots, round seeds and the minimal
//! block shapes exchanged by the optimistic push protocol.
//!
//! Timestamps are Unix seconds (`u64`) so records serialize directly into
//! wire messages and diagnostics output.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::SEED_LEN;

/// Current wall-clock time in Unix seconds.
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Opaque identifier of a remote peer.
///
/// The transport decides the textual form (libp2p base58 peer IDs in
/// production, short names in simulations). Ordering is lexicographic and is
/// what makes peer selection reproducible.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An empty id is used as the broadcast recipient on the wire.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Trust state of a peer. A peer id lives in exactly one of these collections.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    /// Probationary: connected but not yet handshaken, or demoted.
    Greylisted,
    /// Trusted: eligible for gossip selection and chain-data exchange.
    Whitelisted,
    /// Permanently rejected until process restart.
    Banned,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Greylisted => "greylisted",
            PeerStatus::Whitelisted => "whitelisted",
            PeerStatus::Banned => "banned",
        };
        f.write_str(s)
    }
}

/// Everything the admission controller knows about one remote peer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Transport address as reported by the host.
    pub address: String,
    pub status: PeerStatus,
    /// Accumulated misbehaviour penalty. Never decreases and survives
    /// status transitions.
    pub misbehavior_score: u64,
    /// Last time any message from this peer was observed.
    pub last_seen: u64,
    /// Last successful handshake, if any.
    pub last_handshake: Option<u64>,
    /// Client version reported in the peer's handshake.
    pub client_version: String,
    /// Last consensus round the peer was observed in.
    pub last_active_round: u64,
}

impl PeerRecord {
    /// A fresh greylisted record with zero score.
    pub fn new(id: PeerId, address: impl Into<String>, now: u64) -> Self {
        Self {
            id,
            address: address.into(),
            status: PeerStatus::Greylisted,
            misbehavior_score: 0,
            last_seen: now,
            last_handshake: None,
            client_version: String::new(),
            last_active_round: 0,
        }
    }
}

/// Post-mortem snapshot written at the moment a peer is banned.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ReputationRecord {
    pub peer: PeerId,
    pub score: u64,
    /// Round at which the ban happened; drives retention.
    pub round: u64,
    pub reason: String,
    pub banned_at: u64,
}

/// A 32-byte seed derived from a secret and a round number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct RoundSeed(pub [u8; SEED_LEN]);

impl RoundSeed {
    /// `SHA-256(key ‖ bigEndian64(round))`.
    pub fn derive(key: &[u8; SEED_LEN], round: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(round.to_be_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; SEED_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex seed. Returns `None` for empty, non-hex, or wrong-length input.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; SEED_LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for RoundSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A 32-byte hash, hex-encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("hash must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Header of a block as seen by this layer. Consensus fields are opaque here;
/// the chain collaborator owns their meaning.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: Hash256,
    pub payload_hash: Hash256,
    pub timestamp: u64,
}

impl BlockHeader {
    /// SHA-256 over the big-endian encoding of every header field.
    pub fn hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.payload_hash.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        Hash256(hasher.finalize().into())
    }
}

/// A full block: header plus opaque payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl Block {
    /// Build a block whose header commits to `payload`.
    pub fn new(height: u64, prev_hash: Hash256, timestamp: u64, payload: Vec<u8>) -> Self {
        let header = BlockHeader {
            height,
            prev_hash,
            payload_hash: Hash256::digest(&payload),
            timestamp,
        };
        Self { header, payload }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Whether the payload matches the hash committed in the header.
    pub fn verify_payload(&self) -> bool {
        Hash256::digest(&self.payload) == self.header.payload_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_orders_lexicographically() {
        let mut ids = vec![PeerId::from("c"), PeerId::from("a"), PeerId::from("b")];
        ids.sort();
        assert_eq!(ids, vec![PeerId::from("a"), PeerId::from("b"), PeerId::from("c")]);
    }

    #[test]
    fn peer_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&PeerId::from("node-1")).unwrap();
        assert_eq!(json, "\"node-1\"");
    }

    #[test]
    fn new_record_is_greylisted_with_zero_score() {
        let rec = PeerRecord::new(PeerId::from("p"), "/ip4/1.2.3.4/tcp/1", 100);
        assert_eq!(rec.status, PeerStatus::Greylisted);
        assert_eq!(rec.misbehavior_score, 0);
        assert_eq!(rec.last_seen, 100);
        assert!(rec.last_handshake.is_none());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&PeerStatus::Whitelisted).unwrap();
        assert_eq!(json, "\"whitelisted\"");
        assert_eq!(PeerStatus::Banned.to_string(), "banned");
    }

    #[test]
    fn round_seed_depends_on_round_and_key() {
        let key = [7u8; SEED_LEN];
        let a = RoundSeed::derive(&key, 1);
        let b = RoundSeed::derive(&key, 2);
        let c = RoundSeed::derive(&[8u8; SEED_LEN], 1);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, RoundSeed::derive(&key, 1));
    }

    #[test]
    fn round_seed_matches_manual_sha256() {
        let key = [1u8; SEED_LEN];
        let mut buf = key.to_vec();
        buf.extend_from_slice(&42u64.to_be_bytes());
        let expected: [u8; 32] = Sha256::digest(&buf).into();
        assert_eq!(RoundSeed::derive(&key, 42).0, expected);
    }

    #[test]
    fn round_seed_hex_rejects_bad_input() {
        assert!(RoundSeed::from_hex("").is_none());
        assert!(RoundSeed::from_hex("zz").is_none());
        assert!(RoundSeed::from_hex("abcd").is_none());
        let seed = RoundSeed::derive(&[3u8; SEED_LEN], 9);
        assert_eq!(RoundSeed::from_hex(&seed.to_hex()), Some(seed));
    }

    #[test]
    fn hash256_json_is_hex() {
        let h = Hash256([0xAB; 32]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: Hash256 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
        assert!(serde_json::from_str::<Hash256>("\"abcd\"").is_err());
    }

    #[test]
    fn block_payload_commitment() {
        let mut block = Block::new(1, Hash256::ZERO, 1_700_000_000, b"hello".to_vec());
        assert!(block.verify_payload());
        block.payload = b"tampered".to_vec();
        assert!(!block.verify_payload());
    }

    #[test]
    fn header_hash_changes_with_height() {
        let a = Block::new(1, Hash256::ZERO, 10, vec![1]);
        let b = Block::new(2, Hash256::ZERO, 10, vec![1]);
        assert_ne!(a.hash(), b.hash());
    }
}
