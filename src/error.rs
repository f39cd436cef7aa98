use std::time::Duration;

use thiserror::Error;

/// Broker error taxonomy.
///
/// Internal paths keep the kind distinct; only the outermost boundary maps
/// these to user-facing messages.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("validation error: {0}")]
    Validation(String),

    /// Unique-index collision or lost CAS. Handled locally by re-reading or
    /// trying the next candidate, never surfaced to callers as a failure.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("circuit breaker '{dependency}' is open, retry after {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("readiness probe timed out: {0}")]
    ProbeTimeout(String),

    #[error("provisioning failed: {0}")]
    ProvisionFailed(String),

    #[error("resource pressure: {0}")]
    ResourcePressure(String),

    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

// Error conversions for common error types

impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                BrokerError::Conflict(db.to_string())
            }
            sqlx::Error::PoolTimedOut => {
                BrokerError::ResourceUnavailable("database pool exhausted".into())
            }
            sqlx::Error::RowNotFound => BrokerError::NotFound("row not found".into()),
            _ => BrokerError::Database(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        BrokerError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Internal(format!("serialization error: {e}"))
    }
}

impl From<serde_yaml::Error> for BrokerError {
    fn from(e: serde_yaml::Error) -> Self {
        BrokerError::Configuration(e.to_string())
    }
}
