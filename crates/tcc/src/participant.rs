//! The capability contract every participant service implements.

use std::time::Duration;

use async_trait::async_trait;
use common::{ParticipantId, Phase, TransactionId};
use thiserror::Error;
use tx_log::ContextMap;

/// Why a participant call did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParticipantError {
    /// Business rejection (e.g. insufficient funds). Never retried.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Infrastructure failure (e.g. service unavailable). Retried during Confirm/Cancel.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The call did not answer within the coordinator's call timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ParticipantError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ParticipantError::Rejected(reason.into())
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        ParticipantError::Transient(reason.into())
    }

    /// Returns true if the same call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ParticipantError::Rejected(_))
    }
}

/// Result of one participant phase call.
pub type PhaseResult = Result<(), ParticipantError>;

/// A service taking part in TCC transactions.
///
/// Implementations must be idempotent per (transaction, phase): repeating a
/// call that already succeeded must succeed again without touching shared
/// resources a second time. Try should reserve resources under a lease that
/// expires on its own, so a crashed coordinator cannot leak them forever.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Stable identifier used in the log and for recovery.
    fn participant_id(&self) -> ParticipantId;

    /// Reserves the resources this participant needs for the transaction.
    async fn try_execute(&self, transaction_id: TransactionId, context: &ContextMap)
    -> PhaseResult;

    /// Makes the reservation permanent.
    async fn confirm_execute(&self, transaction_id: TransactionId) -> PhaseResult;

    /// Releases the reservation.
    async fn cancel_execute(&self, transaction_id: TransactionId) -> PhaseResult;
}

/// Invokes the operation matching `phase`.
pub(crate) async fn execute_phase(
    participant: &dyn Participant,
    phase: Phase,
    transaction_id: TransactionId,
    context: &ContextMap,
) -> PhaseResult {
    match phase {
        Phase::Try => participant.try_execute(transaction_id, context).await,
        Phase::Confirm => participant.confirm_execute(transaction_id).await,
        Phase::Cancel => participant.cancel_execute(transaction_id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(!ParticipantError::rejected("insufficient funds").is_retryable());
        assert!(ParticipantError::transient("connection reset").is_retryable());
        assert!(ParticipantError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ParticipantError::rejected("out of stock").to_string(),
            "rejected: out of stock"
        );
        assert_eq!(
            ParticipantError::transient("503").to_string(),
            "transient failure: 503"
        );
    }
}
