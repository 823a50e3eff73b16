//! Error types for taskmesh.

use uuid::Uuid;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Generation error: {0}")]
    Generate(#[from] GenerateError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task store / agent registry errors.
///
/// `Unavailable` is transient: callers retry with backoff. `NotFound` is a
/// caller logic error or stale reference and must not produce side effects.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Task {task_id} is {actual}, expected {expected}")]
    StatusConflict {
        task_id: Uuid,
        expected: &'static str,
        actual: String,
    },

    #[error("Agent {name} is no longer available")]
    AgentTaken { name: String },

    #[error("Invalid status value in storage: {0}")]
    InvalidStatus(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the caller should retry the operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Work queue (broker) errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Queue {name} does not exist")]
    UnknownQueue { name: String },

    #[error("Consumer closed for queue {name}")]
    ConsumerClosed { name: String },

    #[error("Failed to encode work item: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Text-transformation (LLM) errors. Terminal for the attempt: the task is
/// marked failed and the message is nacked for redelivery.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
