//! Error type definitions for the playback analytics service.
//!
//! This module defines all error types used throughout the application,
//! providing a hierarchical error system that makes debugging and error
//! handling more straightforward.

use thiserror::Error;

/// Top-level application error type
///
/// This enum represents all possible errors that can occur in the
/// application. It uses `thiserror` to provide automatic error trait
/// implementations and proper error chaining.
#[derive(Error, Debug)]
pub enum AppError {
    /// Store-layer errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Upstream media-server errors
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Push-stream errors
    #[error("Push stream error: {0}")]
    Push(#[from] PushError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Store layer specific errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying SQL failures
    #[error("Query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Migration failures, fatal at startup
    #[error("Migration failed: {name} - {message}")]
    MigrationFailed { name: String, message: String },

    /// Busy/locked retries exhausted
    #[error("Store busy: {operation} gave up after {attempts} attempts")]
    BusyExhausted { operation: String, attempts: u32 },
}

/// Upstream media-server specific errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Network connection timeouts
    #[error("Connection timeout: {url}")]
    Timeout { url: String },

    /// Authentication failures
    #[error("Authentication failed: {server_type} - {message}")]
    AuthenticationFailed {
        server_type: String,
        message: String,
    },

    /// HTTP errors from the upstream server
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// Parsing errors for upstream payloads
    #[error("Parse error: {server_type} - {message}")]
    ParseError {
        server_type: String,
        message: String,
    },

    /// Operations a server type cannot perform
    #[error("Unsupported feature: {feature} for {server_type}")]
    UnsupportedFeature {
        feature: String,
        server_type: String,
    },

    /// A request referenced a server id that is not configured
    #[error("Unknown server: {server_id}")]
    UnknownServer { server_id: String },

    /// Transport-level failures
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Push-stream specific errors
#[derive(Error, Debug)]
pub enum PushError {
    /// WebSocket connect/handshake failures
    #[error("Failed to connect push stream: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    /// Base URL could not be turned into a websocket endpoint
    #[error("Invalid push endpoint: {url} - {message}")]
    InvalidEndpoint { url: String, message: String },

    /// TLS connector construction failures
    #[error("TLS configuration failed: {message}")]
    Tls { message: String },

    /// The read deadline elapsed without any inbound frame
    #[error("Read deadline elapsed after {seconds}s")]
    ReadDeadline { seconds: u64 },

    /// The peer closed the stream
    #[error("Push stream closed by peer")]
    Closed,
}

/// Convenience methods for creating common error types
impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found<R: Into<String>, I: Into<String>>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl SourceError {
    /// Create a timeout error
    pub fn timeout<U: Into<String>>(url: U) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Create an authentication failed error
    pub fn auth_failed<S: Into<String>, M: Into<String>>(server_type: S, message: M) -> Self {
        Self::AuthenticationFailed {
            server_type: server_type.into(),
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse_error<S: Into<String>, M: Into<String>>(server_type: S, message: M) -> Self {
        Self::ParseError {
            server_type: server_type.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported feature error
    pub fn unsupported<F: Into<String>, S: Into<String>>(feature: F, server_type: S) -> Self {
        Self::UnsupportedFeature {
            feature: feature.into(),
            server_type: server_type.into(),
        }
    }
}
