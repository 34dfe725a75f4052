//! Error types for the Palisade engine.

use thiserror::Error;

/// Main error type for Palisade operations.
#[derive(Error, Debug)]
pub enum PalisadeError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] crate::mesh::ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for PalisadeError {
    fn from(err: config::ConfigError) -> Self {
        PalisadeError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for PalisadeError {
    fn from(err: serde_yaml::Error) -> Self {
        PalisadeError::Config(err.to_string())
    }
}

/// Errors raised by a counter store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend did not answer within its time budget
    #[error("store operation timed out after {0} ms")]
    Timeout(u64),

    /// The backend could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The caller passed a window the backend cannot use
    #[error("invalid window for key {0}")]
    InvalidWindow(String),
}

/// Errors raised by a single attack detector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectorError {
    /// The detector failed for another reason
    #[error("detector failed: {0}")]
    Failed(String),
}

/// Errors raised while delivering a security event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    /// The sink rejected or failed to accept the event
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Delivery did not finish within the time budget
    #[error("delivery timed out after {0} ms")]
    Timeout(u64),
}

/// Result type alias for Palisade operations.
pub type Result<T> = std::result::Result<T, PalisadeError>;
