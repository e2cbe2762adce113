//! Error taxonomy for the consensus engine.
//!
//! Call-level failures are carried as structured `CallError` values so
//! they can be persisted verbatim on the answer row. Crate-level errors
//! are `thiserror` enums; only `AllProvidersFailed` and persistence
//! failures ever surface to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::AnswerStatus;

// ---------------------------------------------------------------------------
// Call-level errors
// ---------------------------------------------------------------------------

/// Classification of a single failed provider interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigError,
    AuthError,
    Forbidden,
    /// Local token bucket exhausted.
    RateLimited,
    /// Remote HTTP 429.
    RateLimit,
    ServerError,
    Timeout,
    NetworkError,
    ParseError,
    SafetyBlock,
    CircuitOpen,
    ProviderNotStarted,
    AllProvidersFailed,
    ArbiterFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigError => "config_error",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NetworkError => "network_error",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::SafetyBlock => "safety_block",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::ProviderNotStarted => "provider_not_started",
            ErrorKind::AllProvidersFailed => "all_providers_failed",
            ErrorKind::ArbiterFailed => "arbiter_failed",
        }
    }

    /// The answer status under which a call failure of this kind is
    /// persisted.
    pub fn answer_status(&self) -> AnswerStatus {
        match self {
            ErrorKind::Timeout => AnswerStatus::Timeout,
            ErrorKind::ParseError => AnswerStatus::ParseError,
            _ => AnswerStatus::Error,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error for one provider call. Persisted as the `error`
/// JSON column of a provider answer.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            latency_ms: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// A call is retried only on remote throttling, a retryable server
    /// status, or a transport timeout.
    pub fn is_retryable(&self) -> bool {
        if self.kind == ErrorKind::Timeout {
            return true;
        }
        matches!(self.http_status, Some(429 | 500 | 502 | 503 | 504))
    }

    /// Short, non-leaky message suitable for end users. Callers of
    /// `ProviderClient::call` show this for rejected direct calls.
    pub fn user_message(&self) -> &'static str {
        match self.kind {
            ErrorKind::RateLimited | ErrorKind::RateLimit => THROTTLED_MESSAGE,
            _ => "Something went wrong. Please try again later.",
        }
    }
}

pub type CallResult<T> = Result<T, CallError>;

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Run {id} already reached a terminal status")]
    AlreadyFinal { id: String },

    #[error("Corrupt row: {message}")]
    Corrupt { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Market errors
// ---------------------------------------------------------------------------

/// Errors the coordinator can surface to its caller.
#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("No provider produced a usable answer")]
    AllProvidersFailed,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl MarketError {
    /// Short, non-leaky message suitable for end users.
    pub fn user_message(&self) -> &'static str {
        match self {
            MarketError::AllProvidersFailed => {
                "Unable to get responses from any provider. Please try again later."
            }
            MarketError::Config { .. } | MarketError::Storage(_) => {
                "Something went wrong. Please try again later."
            }
        }
    }
}

/// Shown when the run completed but every arbiter attempt failed.
pub const SYNTHESIS_FAILED_MESSAGE: &str = "Partial results available, but synthesis failed.";

/// Shown when a call is rejected for throttling, local or remote.
pub const THROTTLED_MESSAGE: &str = "Too many requests. Please wait a moment and try again.";

pub type MarketResult<T> = Result<T, MarketError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
