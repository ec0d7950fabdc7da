//! Node configuration for the BAR node.
//!
//! Provides [`NodeConfig`] with defaults for data directory, RPC binding,
//! round pacing, and network settings.

use std::path::PathBuf;
use std::time::Duration;

use bar_core::constants::DEFAULT_RPC_PORT;
use bar_core::error::ConfigError;
use bar_network::NetworkConfig;

/// Default length of a selection round.
pub const DEFAULT_ROUND_INTERVAL: Duration = Duration::from_secs(10);

/// Default period of handshake expiry, deferred promotion and reputation cleanup.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a node instance.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for persistent data (node key).
    pub data_dir: PathBuf,
    /// IP address for the JSON-RPC server to bind to.
    pub rpc_bind: String,
    /// Port for the JSON-RPC server.
    pub rpc_port: u16,
    /// P2P network configuration.
    pub network: NetworkConfig,
    /// Log level filter string (e.g. "info", "debug", "bar_network=trace").
    pub log_level: String,
    /// Wall-clock length of one round. Round `n` starts at `n * round_interval`
    /// seconds after the Unix epoch.
    pub round_interval: Duration,
    pub maintenance_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bar");

        Self {
            data_dir,
            rpc_bind: "127.0.0.1".to_string(),
            rpc_port: DEFAULT_RPC_PORT,
            network: NetworkConfig::default(),
            log_level: "info".to_string(),
            round_interval: DEFAULT_ROUND_INTERVAL,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

impl NodeConfig {
    /// Path of the persisted libp2p identity key.
    pub fn node_key_path(&self) -> PathBuf {
        self.data_dir.join("node.key")
    }

    /// Socket address string for the RPC server.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_bind, self.rpc_port)
    }

    /// Round number for a Unix timestamp.
    pub fn round_at(&self, unix_secs: u64) -> u64 {
        unix_secs / self.round_interval.as_secs().max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.round_interval.as_secs() == 0 {
            return Err(ConfigError::Invalid {
                field: "round_interval",
                reason: "must be at least one second".to_string(),
            });
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::Zero { field: "maintenance_interval" });
        }
        self.network.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rpc_port() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.rpc_port, DEFAULT_RPC_PORT);
        assert_eq!(cfg.rpc_bind, "127.0.0.1");
    }

    #[test]
    fn default_log_level_is_info() {
        assert_eq!(NodeConfig::default().log_level, "info");
    }

    #[test]
    fn default_data_dir_ends_with_bar() {
        let cfg = NodeConfig::default();
        assert!(cfg.data_dir.ends_with("bar"), "data_dir should end with 'bar': {:?}", cfg.data_dir);
    }

    #[test]
    fn rpc_addr_custom() {
        let cfg = NodeConfig {
            rpc_bind: "0.0.0.0".to_string(),
            rpc_port: 9999,
            ..NodeConfig::default()
        };
        assert_eq!(cfg.rpc_addr(), "0.0.0.0:9999");
    }

    #[test]
    fn node_key_path_in_data_dir() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/bar-test"),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.node_key_path(), PathBuf::from("/tmp/bar-test/node.key"));
    }

    #[test]
    fn round_at_divides_by_interval() {
        let cfg = NodeConfig {
            round_interval: Duration::from_secs(10),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.round_at(0), 0);
        assert_eq!(cfg.round_at(99), 9);
        assert_eq!(cfg.round_at(100), 10);
    }

    #[test]
    fn validate_rejects_subsecond_rounds() {
        let cfg = NodeConfig {
            round_interval: Duration::from_millis(500),
            ..NodeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field: "round_interval", .. })));
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_checks_network() {
        let mut cfg = NodeConfig::default();
        cfg.network.policy.pom_ban_threshold = 1;
        cfg.network.policy.pom_threshold = 5;
        assert!(matches!(cfg.validate(), Err(ConfigError::Thresholds { .. })));
    }
}
