//! Sync error types

use thiserror::Error;

/// Errors raised while reconciling billing state
#[derive(Debug, Error)]
pub enum SyncError {
    /// Provider returned HTTP 429; retryable with backoff up to a bound
    #[error("Rate limited by billing provider")]
    RateLimited,

    /// Non-retryable provider failure; terminal for that page or customer
    #[error("Billing API request failed with status {status}: {message}")]
    RequestFailed { status: u16, message: String },

    /// A single account or profile save failed; non-fatal to the batch
    #[error("Failed to save {entity} {id}: {message}")]
    EntitySaveFailed {
        entity: &'static str,
        id: String,
        message: String,
    },

    /// A required collaborator is unavailable; fatal, aborts the whole run
    #[error("Required collaborator unavailable: {0}")]
    MissingCollaborator(&'static str),

    /// Account has no usable customer identifier; warning-level, skip
    #[error("Account {0} has no Chargebee customer id")]
    MissingCustomerId(i64),

    /// No subscription found for the customer; warning-level, skip
    #[error("No subscription found for customer {0}")]
    NoSubscriptionFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true if this error is transient and the same request should
    /// be retried after a backoff delay
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::RateLimited)
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Database(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
