//! Error types for the BAR layer.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("transport stopped")] TransportStopped,
    #[error("publish to {topic} failed: {reason}")] PublishFailed { topic: String, reason: String },
    #[error("dial failed: {0}")] DialFailed(String),
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("outgoing connection limit reached: {0}")] OutgoingLimit(usize),
    #[error("transport setup failed: {0}")] Setup(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed message: {0}")] Malformed(String),
    #[error("message too large: {size} > {max}")] MessageTooLarge { size: usize, max: usize },
    #[error("invalid field {field}: {reason}")] InvalidField { field: &'static str, reason: String },
    #[error("too many {field}: {count} > {max}")] TooManyItems { field: &'static str, count: usize, max: usize },
    #[error("encode error: {0}")] Encode(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("height not found: {0}")] HeightNotFound(u64),
    #[error("invalid block: {0}")] InvalidBlock(String),
    #[error("not contiguous: expected height {expected}, got {got}")] NotContiguous { expected: u64, got: u64 },
    #[error("conflicting block at height {0}")] Conflict(u64),
    #[error("storage: {0}")] Storage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")] Zero { field: &'static str },
    #[error("ban threshold {ban} below demotion threshold {demote}")] Thresholds { demote: u64, ban: u64 },
    #[error("invalid value for {field}: {reason}")] Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum BarError {
    #[error(transparent)] Network(#[from] NetworkError),
    #[error(transparent)] Protocol(#[from] ProtocolError),
    #[error(transparent)] Chain(#[from] ChainError),
    #[error(transparent)] Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_error_converts_into_bar_error() {
        let err: BarError = NetworkError::TransportStopped.into();
        assert!(matches!(err, BarError::Network(NetworkError::TransportStopped)));
        assert_eq!(err.to_string(), "transport stopped");
    }

    #[test]
    fn protocol_error_display() {
        let err = ProtocolError::TooManyItems { field: "evidence", count: 40, max: 32 };
        assert_eq!(err.to_string(), "too many evidence: 40 > 32");
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::Thresholds { demote: 5, ban: 3 };
        assert!(err.to_string().contains("below demotion threshold"));
    }
}
