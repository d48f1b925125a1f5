//! Error Module
//!
//! Defines error types and result types used throughout the object gateway.

use thiserror::Error;

/// Main error type for the object gateway
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("Unparseable range: {0}")]
    UnparseableRange(String),

    #[error("Unsatisfiable range: {0}")]
    UnsatisfiableRange(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Not modified: {0}")]
    NotModified(String),

    #[error("Origin transport error: {0}")]
    OriginTransport(String),

    #[error("Cache read error: {0}")]
    CacheRead(String),

    #[error("Cache write error: {0}")]
    CacheWrite(String),

    #[error("Invalid chunk manifest: {0}")]
    ChunkedManifestInvalid(String),

    #[error("Size cap exceeded: {0}")]
    SizeCapExceeded(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        GatewayError::OriginTransport(err.to_string())
    }
}

impl From<hyper::http::Error> for GatewayError {
    fn from(err: hyper::http::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// Result type alias for the object gateway
pub type Result<T> = std::result::Result<T, GatewayError>;
