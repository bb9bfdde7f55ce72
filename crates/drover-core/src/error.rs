use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for drover.
#[derive(Error, Debug)]
pub enum AppError {
    /// No resource was handed over before the acquire deadline.
    #[error("Timed out after {}ms waiting for a pooled resource", .0.as_millis())]
    PoolTimeout(Duration),

    /// The pool is draining or already shut down.
    #[error("Resource pool is shut down")]
    PoolShutdown,

    /// Constructing a new resource failed. Fatal to one acquire, not to the pool.
    #[error("Failed to create resource: {0}")]
    ResourceCreation(String),

    /// A caller-supplied operation failed while holding a resource.
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Every attempt of a retried task failed.
    #[error("Task '{task}' failed after {attempts} attempts: {source}")]
    RetryExhausted {
        task: String,
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    /// A cache producer failed. Nothing was cached.
    #[error("Cache producer failed: {0}")]
    Producer(String),

    /// No task is registered under this name.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// A task with this name is already registered.
    #[error("Task already registered: {0}")]
    DuplicateTask(String),

    /// Interval or cron expression could not be parsed.
    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Headless browser / CDP failure.
    #[error("Browser error: {0}")]
    Browser(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::PoolTimeout(_)
            | AppError::ResourceCreation(_)
            | AppError::Operation(_)
            | AppError::Producer(_)
            | AppError::Browser(_)
            | AppError::Generic(_) => true,
            AppError::PoolShutdown
            | AppError::RetryExhausted { .. }
            | AppError::UnknownTask(_)
            | AppError::DuplicateTask(_)
            | AppError::InvalidSchedule { .. }
            | AppError::ConfigError(_)
            | AppError::SerializationError(_) => false,
        }
    }

    /// Returns true if the error originated in the resource pool rather than
    /// in the caller's own operation.
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            AppError::PoolTimeout(_) | AppError::PoolShutdown | AppError::ResourceCreation(_)
        )
    }

    /// The innermost error, unwrapping retry exhaustion.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}
