//! Store Errors
//!
//! Error types for transaction and outbox persistence.

/// Errors that can occur in the transaction or outbox store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Idempotency key already bound to another transaction
    #[error("Idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),

    /// Persisted row could not be mapped back to the domain
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// Store temporarily unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}
