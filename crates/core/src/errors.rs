//! Error types

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown timestamp unit: {0}")]
    UnknownTimestampUnit(String),
}

/// Aggregator feed errors
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Subscription completed by remote: {0}")]
    Completed(String),

    #[error("Feed disconnected")]
    Disconnected,

    #[error("Timeout waiting for data")]
    Timeout,
}

/// Metrics registry errors
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Invalid aggregator name for metrics: {0}")]
    InvalidName(String),

    #[error("Failed to register {name}: {reason}")]
    Registration { name: String, reason: String },

    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}

/// Result type alias
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type FeedResult<T> = Result<T, FeedError>;
pub type MetricsResult<T> = Result<T, MetricsError>;
