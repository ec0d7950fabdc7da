//! Protocol constants and configuration defaults.
//!
//! Defaults mirror the admission policy described for the BAR layer; every
//! one of them can be overridden through the network crate's config types.

use std::time::Duration;

/// Client version string advertised in every wire message.
pub const CLIENT_VERSION: &str = concat!("bar/", env!("CARGO_PKG_VERSION"));

/// Default TCP port for the P2P transport.
pub const DEFAULT_P2P_PORT: u16 = 30_333;

/// Default port for the JSON-RPC diagnostics server.
pub const DEFAULT_RPC_PORT: u16 = 30_334;

/// Default network identifier. Nodes only complete handshakes with peers
/// configured with the same identifier.
pub const DEFAULT_NETWORK_ID: &str = "bar-mainnet";

// ---------------------------------------------------------------------------
// Admission policy
// ---------------------------------------------------------------------------

/// Maximum number of whitelisted (trusted) peers.
pub const DEFAULT_WHITELIST_CAPACITY: usize = 8;

/// Maximum number of concurrent outgoing connections.
pub const DEFAULT_MAX_OUTGOING: usize = 8;

/// Misbehaviour score at which a whitelisted peer is demoted.
pub const DEFAULT_POM_THRESHOLD: u64 = 5;

/// Misbehaviour score at which a greylisted peer is banned.
pub const DEFAULT_POM_BAN_THRESHOLD: u64 = 15;

/// Number of rounds a reputation record survives after a ban.
pub const DEFAULT_REPUTATION_RETENTION_ROUNDS: u64 = 10;

/// How long a handshake may stay outstanding.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum distance between a handshake's round and the receiver's round.
pub const ROUND_SEED_TOLERANCE: u64 = 2;

/// Length of round seeds and base secrets in bytes.
pub const SEED_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Inactivity detection
// ---------------------------------------------------------------------------

/// Interval of the seed-node probe loop.
pub const DEFAULT_INACTIVITY_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A peer silent for longer than this is judged inactive by the probe.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Distinct reporters required before a peer is marked inactive.
pub const DEFAULT_SEED_NODE_THRESHOLD: usize = 3;

/// Report count that, combined with [`DEFAULT_PERSISTENT_REPORT_WINDOW`],
/// marks a peer inactive even with a single reporter.
pub const DEFAULT_PERSISTENT_REPORT_COUNT: u64 = 5;

/// Minimum age of the first report for the persistent-reporter rule.
pub const DEFAULT_PERSISTENT_REPORT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Evidence not refreshed for this long is discarded.
pub const DEFAULT_EVIDENCE_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Cap on stored reasons and evidence tags per suspected peer.
pub const MAX_EVIDENCE_ENTRIES: usize = 64;

// ---------------------------------------------------------------------------
// Optimistic push
// ---------------------------------------------------------------------------

/// Number of trailing headers served to light nodes.
pub const DEFAULT_HEADER_WINDOW: u64 = 100;

/// How long a push request may stay outstanding.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Wire limits
// ---------------------------------------------------------------------------

/// Maximum encoded size of any wire message.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum block payload carried in a push message.
pub const MAX_BLOCK_PAYLOAD: usize = 1024 * 1024;

/// Maximum length of free-text fields (reasons, versions, addresses).
pub const MAX_TEXT_LEN: usize = 512;

/// Maximum number of evidence tags in a single inactivity message.
pub const MAX_EVIDENCE_TAGS: usize = 32;
