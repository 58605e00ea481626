use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{Sequence, TransactionId};

/// Errors that can occur when interacting with the transaction log.
#[derive(Debug, Error)]
pub enum LogError {
    /// A conditional append found the log at a different sequence than expected.
    #[error(
        "Sequence conflict for transaction {transaction_id}: expected {expected}, found {actual}"
    )]
    SequenceConflict {
        transaction_id: TransactionId,
        expected: Sequence,
        actual: Sequence,
    },

    /// Another coordinator holds an unexpired execution lease.
    #[error("Transaction {transaction_id} is leased by {owner} until {expires_at}")]
    LeaseHeld {
        transaction_id: TransactionId,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    /// The append request was malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for transaction log operations.
pub type Result<T> = std::result::Result<T, LogError>;
