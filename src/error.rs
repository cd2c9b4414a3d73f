//! Error types for inbox triage.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Classification pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Model output rejected: {0}")]
    InvalidResponse(String),

    #[error("Batch of {size} threads exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("No buckets to classify into")]
    NoBuckets,

    #[error("A classification run is already in progress for user {user_id}")]
    AlreadyRunning { user_id: String },

    #[error("Classification run timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("Batch task failed: {0}")]
    Task(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
