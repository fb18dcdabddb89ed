//! Error types for the victims database

use thiserror::Error;

/// Result type alias using the victims Error
pub type Result<T> = std::result::Result<T, Error>;

/// Victims error types
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    // === Synchronization Errors ===
    #[error("Sync of {feed} feed since {watermark} failed: {cause}")]
    SyncFailed {
        feed: String,
        watermark: String,
        #[source]
        cause: Box<Error>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Missing required configuration: {key}")]
    MissingConfig { key: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap a transport, decode or store failure with the feed and watermark it happened on
    pub fn sync_failed(feed: impl Into<String>, watermark: impl Into<String>, cause: Error) -> Self {
        Error::SyncFailed {
            feed: feed.into(),
            watermark: watermark.into(),
            cause: Box::new(cause),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Storage(_) => true,
            Error::SyncFailed { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Get an error code for logging
    pub fn code(&self) -> &'static str {
        match self {
            Error::Storage(_) => "STORAGE_ERROR",
            Error::InvalidRecord(_) => "INVALID_RECORD",
            Error::SyncFailed { .. } => "SYNC_FAILED",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::Configuration(_) => "CONFIG_ERROR",
            Error::MissingConfig { .. } => "MISSING_CONFIG",
            Error::InvalidConfig { .. } => "INVALID_CONFIG",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
