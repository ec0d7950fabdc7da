//! Network configuration for the BAR layer.
//!
//! [`AdmissionPolicy`] governs the peer admission controller,
//! [`InactivityConfig`] the seed-node liveness protocol and [`PushConfig`] the
//! optimistic push protocol. [`NetworkConfig`] bundles them with the
//! transport settings.

use bar_core::constants::*;
use bar_core::error::ConfigError;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

/// Limits and thresholds applied by the peer admission controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Maximum number of whitelisted peers.
    pub whitelist_capacity: usize,
    /// Maximum number of outgoing connections opened by this node.
    pub max_outgoing: usize,
    /// Score at which a whitelisted peer is demoted to the greylist.
    pub pom_threshold: u64,
    /// Score at which a greylisted peer is banned.
    pub pom_ban_threshold: u64,
    /// Rounds a reputation record is kept after a ban.
    pub reputation_retention_rounds: u64,
    /// Deadline for a handshake to complete.
    pub handshake_timeout: Duration,
    /// Bootstrap addresses dialled at startup.
    pub seed_addresses: Vec<String>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            whitelist_capacity: DEFAULT_WHITELIST_CAPACITY,
            max_outgoing: DEFAULT_MAX_OUTGOING,
            pom_threshold: DEFAULT_POM_THRESHOLD,
            pom_ban_threshold: DEFAULT_POM_BAN_THRESHOLD,
            reputation_retention_rounds: DEFAULT_REPUTATION_RETENTION_ROUNDS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            seed_addresses: Vec::new(),
        }
    }
}

impl AdmissionPolicy {
    /// Reject policies the controller cannot operate under.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.whitelist_capacity == 0 {
            return Err(ConfigError::Zero { field: "whitelist_capacity" });
        }
        if self.max_outgoing == 0 {
            return Err(ConfigError::Zero { field: "max_outgoing" });
        }
        if self.pom_threshold == 0 {
            return Err(ConfigError::Zero { field: "pom_threshold" });
        }
        if self.pom_ban_threshold < self.pom_threshold {
            return Err(ConfigError::Thresholds {
                demote: self.pom_threshold,
                ban: self.pom_ban_threshold,
            });
        }
        if self.reputation_retention_rounds == 0 {
            return Err(ConfigError::Zero { field: "reputation_retention_rounds" });
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "handshake_timeout" });
        }
        Ok(())
    }
}

/// Settings for the seed-node inactivity protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InactivityConfig {
    /// Whether this node actively probes peers.
    pub is_seed_node: bool,
    /// Probe loop interval.
    pub check_interval: Duration,
    /// Silence after which a peer is judged inactive.
    pub inactivity_timeout: Duration,
    /// Distinct reporters needed to mark a peer inactive.
    pub seed_node_threshold: usize,
    /// Reports needed by the persistent-reporter rule.
    pub persistent_report_count: u64,
    /// Minimum age of the first report for the persistent-reporter rule.
    pub persistent_report_window: Duration,
    /// Evidence untouched for this long is discarded.
    pub evidence_retention: Duration,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            is_seed_node: false,
            check_interval: DEFAULT_INACTIVITY_CHECK_INTERVAL,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            seed_node_threshold: DEFAULT_SEED_NODE_THRESHOLD,
            persistent_report_count: DEFAULT_PERSISTENT_REPORT_COUNT,
            persistent_report_window: DEFAULT_PERSISTENT_REPORT_WINDOW,
            evidence_retention: DEFAULT_EVIDENCE_RETENTION,
        }
    }
}

/// Settings for the optimistic push protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConfig {
    /// Request headers only instead of full blocks.
    pub light_node: bool,
    /// Number of trailing headers served to light nodes.
    pub header_window: u64,
    /// Deadline for a push request to be answered.
    pub push_timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            light_node: false,
            header_window: DEFAULT_HEADER_WINDOW,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

/// Configuration for the BAR network layer.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// IP address to listen on.
    pub listen_addr: String,
    /// TCP port to listen on.
    pub listen_port: u16,
    /// Enable mDNS peer discovery (useful for local/testnet).
    pub enable_mdns: bool,
    /// Gossipsub heartbeat interval.
    pub gossipsub_heartbeat: Duration,
    /// Path of the persistent node identity key. `None` generates an
    /// ephemeral identity.
    pub node_key_path: Option<PathBuf>,
    /// Network identifier; keys the handshake round seeds.
    pub network_id: String,
    /// Version string advertised to peers.
    pub client_version: String,
    pub policy: AdmissionPolicy,
    pub inactivity: InactivityConfig,
    pub push: PushConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_P2P_PORT,
            enable_mdns: true,
            gossipsub_heartbeat: Duration::from_secs(1),
            node_key_path: None,
            network_id: DEFAULT_NETWORK_ID.to_string(),
            client_version: CLIENT_VERSION.to_string(),
            policy: AdmissionPolicy::default(),
            inactivity: InactivityConfig::default(),
            push: PushConfig::default(),
        }
    }
}

impl NetworkConfig {
    /// Configuration preset for testnet: mDNS enabled, separate network id.
    pub fn testnet() -> Self {
        Self {
            enable_mdns: true,
            network_id: "bar-testnet".to_string(),
            ..Self::default()
        }
    }

    /// Configuration preset for mainnet: mDNS disabled.
    pub fn mainnet() -> Self {
        Self {
            enable_mdns: false,
            ..Self::default()
        }
    }

    /// Build the libp2p multiaddr string for the configured listen address and port.
    pub fn listen_multiaddr(&self) -> String {
        format!("/ip4/{}/tcp/{}", self.listen_addr, self.listen_port)
    }

    /// Network-wide key that handshake round seeds are derived from:
    /// `SHA-256("bar/handshake/" ‖ network_id)`.
    pub fn handshake_key(&self) -> [u8; SEED_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(b"bar/handshake/");
        hasher.update(self.network_id.as_bytes());
        hasher.finalize().into()
    }

    /// Validate every sub-configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy.validate()?;
        if self.network_id.is_empty() {
            return Err(ConfigError::Invalid {
                field: "network_id",
                reason: "must not be empty".into(),
            });
        }
        if self.inactivity.seed_node_threshold == 0 {
            return Err(ConfigError::Zero { field: "seed_node_threshold" });
        }
        if self.inactivity.check_interval.is_zero() {
            return Err(ConfigError::Zero { field: "check_interval" });
        }
        if self.inactivity.inactivity_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "inactivity_timeout" });
        }
        if self.push.push_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "push_timeout" });
        }
        if self.push.header_window == 0 {
            return Err(ConfigError::Zero { field: "header_window" });
        }
        Ok(())
    }
}
