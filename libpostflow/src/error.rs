//! Error types for Postflow
//!
//! Every failure in the publishing pipeline is classified with a single
//! [`ErrorCode`]. Platform adapters, the rate limiter and the API manager
//! raise [`PlatformError`], which carries the code together with a free-form
//! context map; the rest of the crate wraps it in [`PostflowError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PostflowError>;

/// Error taxonomy shared across the publishing core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad input: past schedule time, missing required media, content too long
    ValidationError,
    /// Token invalid, expired, or refresh failed
    AuthError,
    /// Quota exhausted; carries `blocked_until` when a block is active
    RateLimitExceeded,
    /// Unclassified provider failure
    ApiError,
    /// Transport-level failure
    NetworkError,
    /// Adapter-level processing failure (media timeout, unsupported operation)
    PlatformError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::AuthError => "AUTH_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ApiError => "API_ERROR",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::PlatformError => "PLATFORM_ERROR",
        }
    }

    /// HTTP status surfaced to callers of the core
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 400,
            ErrorCode::AuthError => 401,
            ErrorCode::RateLimitExceeded => 429,
            ErrorCode::ApiError => 502,
            ErrorCode::NetworkError | ErrorCode::PlatformError => 500,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "Content validation failed",
            ErrorCode::AuthError => "Authentication failed",
            ErrorCode::RateLimitExceeded => "Rate limit exceeded",
            ErrorCode::ApiError => "API request failed",
            ErrorCode::NetworkError => "Network error",
            ErrorCode::PlatformError => "Platform processing failed",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure raised by a platform adapter or by the pipeline around it
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}: {message}", .code.label())]
pub struct PlatformError {
    pub code: ErrorCode,
    pub message: String,
    pub context: Map<String, Value>,
    /// Set on RATE_LIMIT_EXCEEDED when the key is blocked
    pub blocked_until: Option<DateTime<Utc>>,
}

impl PlatformError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: Map::new(),
            blocked_until: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthError, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RateLimitExceeded, message)
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ApiError, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message)
    }

    pub fn platform(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PlatformError, message)
    }

    /// Add a context entry, replacing any previous value for the key
    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_blocked_until(mut self, until: DateTime<Utc>) -> Self {
        self.blocked_until = Some(until);
        self.context
            .insert("blockedUntil".to_string(), Value::String(until.to_rfc3339()));
        self
    }

    /// True when this error reports an exhausted polling loop
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::PlatformError
            && self.context.get("timeout") == Some(&Value::Bool(true))
    }

    /// Platform recorded in the context, if any
    pub fn platform_name(&self) -> Option<&str> {
        self.context.get("platform").and_then(Value::as_str)
    }
}

#[derive(Error, Debug)]
pub enum PostflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl PostflowError {
    /// Classification of this error, `None` when it is unclassified
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            PostflowError::Platform(e) => Some(e.code),
            PostflowError::InvalidInput(_) => Some(ErrorCode::ValidationError),
            PostflowError::Config(_) | PostflowError::Database(_) | PostflowError::Cancelled(_) => {
                None
            }
        }
    }

    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.code() {
            Some(ErrorCode::ValidationError) => 3,
            Some(ErrorCode::AuthError) => 2,
            _ => 1,
        }
    }

    pub fn http_status(&self) -> u16 {
        self.code().map(|c| c.http_status()).unwrap_or(500)
    }

    /// Seconds a client should wait before retrying, derived from `blocked_until`
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        match self {
            PostflowError::Platform(e) => e.blocked_until.map(|until| {
                let millis = (until - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            }),
            _ => None,
        }
    }

    pub fn as_platform(&self) -> Option<&PlatformError> {
        match self {
            PostflowError::Platform(e) => Some(e),
            _ => None,
        }
    }

    /// Human-readable message recorded on failed posts
    pub fn message(&self) -> String {
        match self {
            PostflowError::Platform(e) => e.message.clone(),
            PostflowError::InvalidInput(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

/// JSON error body surfaced to HTTP callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

impl From<&PostflowError> for ErrorResponse {
    fn from(error: &PostflowError) -> Self {
        let context = error
            .as_platform()
            .filter(|e| !e.context.is_empty())
            .map(|e| e.context.clone());
        Self {
            error: error.message(),
            code: error.code(),
            context,
        }
    }
}
