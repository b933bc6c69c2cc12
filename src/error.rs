// src/error.rs

//! Unified error handling for the sync engine.

use std::fmt;

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Realm or entity missing, upstream or locally
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream answered 429
    #[error("Rate limited by upstream (credential {client_id})")]
    RateLimited { client_id: String },

    /// No credential with the requested clearance is currently usable
    #[error("Credential pool exhausted for clearance '{0}'")]
    PoolExhausted(String),

    /// Timeout, 5xx or other recoverable upstream failure
    #[error("Transient failure in {context}: {message}")]
    Transient { context: String, message: String },

    /// Malformed job payload or bad input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl AppError {
    /// Create a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a rate-limit error for the credential that hit it.
    pub fn rate_limited(client_id: impl Into<String>) -> Self {
        Self::RateLimited {
            client_id: client_id.into(),
        }
    }

    /// Create a transient error with context.
    pub fn transient(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Transient {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the queue's retry policy should apply to a job that failed with this error.
    ///
    /// `NotFound` and `Validation` are surfaced immediately and never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::RateLimited { .. } | Self::PoolExhausted(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}
