//! Wire message types for the BAR protocols.
//!
//! Each protocol has its own gossipsub topic and a JSON-encoded message type.
//! An empty `to` field addresses every subscriber of the topic. Messages are
//! size-checked before decoding and validated after decoding; anything that
//! fails either step is a protocol violation by the sender.

use bar_core::constants::{MAX_BLOCK_PAYLOAD, MAX_EVIDENCE_TAGS, MAX_MESSAGE_SIZE, MAX_TEXT_LEN};
use bar_core::error::ProtocolError;
use bar_core::types::{Block, BlockHeader, PeerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Gossipsub topic for the ping/pong/ack handshake.
pub const HANDSHAKE_TOPIC: &str = "/bar/handshake/1";

/// Gossipsub topic for seed-node inactivity reports.
pub const INACTIVITY_TOPIC: &str = "/bar/inactivity/1";

/// Gossipsub topic for optimistic chain-data push.
pub const PUSH_TOPIC: &str = "/bar/push/1";

/// Every topic a BAR node joins at startup.
pub const ALL_TOPICS: [&str; 3] = [HANDSHAKE_TOPIC, INACTIVITY_TOPIC, PUSH_TOPIC];

/// Upper bound on headers carried by one push message.
pub const MAX_PUSH_HEADERS: usize = 1_000;

/// Common behaviour of the three BAR message types.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    /// Topic the message is published on.
    const TOPIC: &'static str;

    /// Check field constraints that serde cannot express.
    fn validate(&self) -> Result<(), ProtocolError>;

    fn sender(&self) -> &PeerId;

    fn recipient(&self) -> &PeerId;

    /// Whether `local` should process this message.
    fn is_addressed_to(&self, local: &PeerId) -> bool {
        self.recipient().is_empty() || self.recipient() == local
    }

    /// Validate and serialize to JSON.
    fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.validate()?;
        let data = serde_json::to_vec(self).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(data)
    }

    /// Size-check, deserialize from JSON and validate.
    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let msg: Self = serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        msg.validate()?;
        Ok(msg)
    }
}

fn require_sender(from: &PeerId) -> Result<(), ProtocolError> {
    if from.is_empty() {
        return Err(ProtocolError::InvalidField {
            field: "from",
            reason: "empty sender".into(),
        });
    }
    Ok(())
}

fn bounded_text(field: &'static str, value: &str) -> Result<(), ProtocolError> {
    if value.len() > MAX_TEXT_LEN {
        return Err(ProtocolError::InvalidField {
            field,
            reason: format!("{} bytes exceeds {MAX_TEXT_LEN}", value.len()),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeKind {
    Ping,
    Pong,
    Ack,
}

/// One leg of the three-message handshake.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HandshakeMessage {
    #[serde(rename = "type")]
    pub kind: HandshakeKind,
    pub from: PeerId,
    #[serde(default)]
    pub to: PeerId,
    pub round: u64,
    /// Hex-encoded 32-byte round seed.
    pub round_seed: String,
    pub timestamp: u64,
    pub client_version: String,
    /// Address the sender observed for the recipient.
    #[serde(default)]
    pub addr_received: String,
    /// Address the sender believes it is reachable at.
    #[serde(default)]
    pub addr_from: String,
    #[serde(default)]
    pub last_round: u64,
    pub nonce: u64,
}

impl WireMessage for HandshakeMessage {
    const TOPIC: &'static str = HANDSHAKE_TOPIC;

    fn validate(&self) -> Result<(), ProtocolError> {
        require_sender(&self.from)?;
        bounded_text("client_version", &self.client_version)?;
        bounded_text("addr_received", &self.addr_received)?;
        bounded_text("addr_from", &self.addr_from)?;
        bounded_text("round_seed", &self.round_seed)
    }

    fn sender(&self) -> &PeerId {
        &self.from
    }

    fn recipient(&self) -> &PeerId {
        &self.to
    }
}

// ---------------------------------------------------------------------------
// Inactivity
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InactivityKind {
    /// Seed-only instruction to treat `target_peer` as inactive.
    MarkInactive,
    /// Evidence that `target_peer` looks inactive to the sender.
    InactivityReport,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct InactivityMessage {
    #[serde(rename = "type")]
    pub kind: InactivityKind,
    pub from: PeerId,
    #[serde(default)]
    pub to: PeerId,
    pub target_peer: PeerId,
    pub timestamp: u64,
    pub client_version: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl WireMessage for InactivityMessage {
    const TOPIC: &'static str = INACTIVITY_TOPIC;

    fn validate(&self) -> Result<(), ProtocolError> {
        require_sender(&self.from)?;
        if self.target_peer.is_empty() {
            return Err(ProtocolError::InvalidField {
                field: "target_peer",
                reason: "empty target".into(),
            });
        }
        bounded_text("client_version", &self.client_version)?;
        bounded_text("reason", &self.reason)?;
        if self.evidence.len() > MAX_EVIDENCE_TAGS {
            return Err(ProtocolError::TooManyItems {
                field: "evidence",
                count: self.evidence.len(),
                max: MAX_EVIDENCE_TAGS,
            });
        }
        for tag in &self.evidence {
            bounded_text("evidence", tag)?;
        }
        Ok(())
    }

    fn sender(&self) -> &PeerId {
        &self.from
    }

    fn recipient(&self) -> &PeerId {
        &self.to
    }
}

// ---------------------------------------------------------------------------
// Optimistic push
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    PushRequest,
    PushResponse,
    BlockData,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: PushKind,
    pub from: PeerId,
    #[serde(default)]
    pub to: PeerId,
    /// Correlates a `push_response` with its `push_request`.
    pub request_id: u64,
    pub timestamp: u64,
    pub client_version: String,
    /// Sender's chain height when the message was built.
    #[serde(default)]
    pub block_height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_data: Option<Block>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_headers: Vec<BlockHeader>,
    #[serde(default)]
    pub is_light_node: bool,
}

impl WireMessage for PushMessage {
    const TOPIC: &'static str = PUSH_TOPIC;

    fn validate(&self) -> Result<(), ProtocolError> {
        require_sender(&self.from)?;
        bounded_text("client_version", &self.client_version)?;
        if self.block_headers.len() > MAX_PUSH_HEADERS {
            return Err(ProtocolError::TooManyItems {
                field: "block_headers",
                count: self.block_headers.len(),
                max: MAX_PUSH_HEADERS,
            });
        }
        if let Some(block) = &self.block_data {
            if block.payload.len() > MAX_BLOCK_PAYLOAD {
                return Err(ProtocolError::InvalidField {
                    field: "block_data",
                    reason: format!("payload of {} bytes exceeds {MAX_BLOCK_PAYLOAD}", block.payload.len()),
                });
            }
        }
        Ok(())
    }

    fn sender(&self) -> &PeerId {
        &self.from
    }

    fn recipient(&self) -> &PeerId {
        &self.to
    }
}
