//! Coordinator error types.

use chrono::{DateTime, Utc};
use common::{ParticipantId, TransactionId, TransactionStatus};
use thiserror::Error;
use tx_log::LogError;

/// Errors that can occur during coordinator operations.
///
/// Participant failures are not errors at this level: they drive the
/// protocol (Cancel, retries, `Stuck`) and are reported through the
/// transaction status.
#[derive(Debug, Error)]
pub enum TccError {
    /// The request is not valid in the transaction's current state.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No transaction with this ID is known.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// A logged participant could not be resolved to a live participant.
    #[error("Unknown participant {participant_id} in transaction {transaction_id}")]
    UnknownParticipant {
        transaction_id: TransactionId,
        participant_id: ParticipantId,
    },

    /// The requested status change is not allowed.
    #[error("Invalid status transition for {transaction_id}: {from} -> {to}")]
    InvalidTransition {
        transaction_id: TransactionId,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Another coordinator instance is driving this transaction.
    #[error("Transaction {transaction_id} is leased by {owner} until {expires_at}")]
    LeaseHeld {
        transaction_id: TransactionId,
        owner: String,
        expires_at: DateTime<Utc>,
    },

    /// This instance is already driving the transaction.
    #[error("Transaction {0} is already being driven by this coordinator")]
    AlreadyActive(TransactionId),

    /// Transaction log error.
    #[error("Transaction log error: {0}")]
    Log(#[source] LogError),

    /// The retry scheduler stopped before resolving a unit.
    #[error("Retry scheduler is shut down")]
    SchedulerClosed,
}

impl From<LogError> for TccError {
    fn from(error: LogError) -> Self {
        match error {
            LogError::LeaseHeld {
                transaction_id,
                owner,
                expires_at,
            } => TccError::LeaseHeld {
                transaction_id,
                owner,
                expires_at,
            },
            other => TccError::Log(other),
        }
    }
}

/// Convenience type alias for coordinator results.
pub type Result<T> = std::result::Result<T, TccError>;
