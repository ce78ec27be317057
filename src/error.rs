//! Error types for the broker and its store adapters.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    Validation(String),

    #[error("Already subscribed to tags: {}", .0.join(", "))]
    DuplicateSubscription(Vec<String>),

    #[error("Not subscribed to tags: {}", .0.join(", "))]
    NoSuchSubscription(Vec<String>),

    #[error("Object not found")]
    NotFound,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// The credential presented at connection time was rejected.
    pub fn invalid_token() -> Self {
        BrokerError::Authorization("invalid token".to_string())
    }

    /// Wire error code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::Authorization(_) => "authorization",
            BrokerError::Validation(_) => "validation",
            _ => "unknown",
        }
    }

    /// Detail text reported to clients.
    ///
    /// Validation failures only carry their first line.
    pub fn detail(&self) -> String {
        match self {
            BrokerError::Validation(msg) => msg.lines().next().unwrap_or_default().to_string(),
            other => other.to_string(),
        }
    }

    /// Whether a failed read may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::StoreUnavailable(_) | BrokerError::Io(_))
    }

    /// Whether the error ends the session instead of producing a reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Transport(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BrokerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for BrokerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        BrokerError::Deserialization(e.to_string())
    }
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(BrokerError::invalid_token().code(), "authorization");
        assert_eq!(BrokerError::invalid_token().detail(), "invalid token");
        assert_eq!(BrokerError::Validation("x".into()).code(), "validation");
        assert_eq!(BrokerError::NotFound.code(), "unknown");
        assert_eq!(
            BrokerError::DuplicateSubscription(vec!["a".into()]).code(),
            "unknown"
        );
    }

    #[test]
    fn test_validation_detail_is_first_line() {
        let err = BrokerError::Validation("'key' is required\nat /update".into());
        assert_eq!(err.detail(), "'key' is required");
    }

    #[test]
    fn test_subscription_errors_name_tags() {
        let err = BrokerError::NoSuchSubscription(vec!["c".into(), "d".into()]);
        assert_eq!(err.detail(), "Not subscribed to tags: c, d");
    }
}
