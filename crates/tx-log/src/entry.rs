use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ParticipantId, Phase, PhaseOutcome, TransactionId, TransactionStatus};

/// Shared payload handed to every participant's Try.
pub type ContextMap = HashMap<String, serde_json::Value>;

/// Unique identifier for a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Creates a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an entry ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an entry within one transaction's log.
///
/// Sequences start at 1 for the first entry and increment by 1 for each
/// subsequent entry of the same transaction. `Sequence::initial()` (0)
/// denotes an empty log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Sequence(i64);

impl Sequence {
    /// Creates a sequence from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the sequence of an empty log (0).
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the sequence of the first entry (1).
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next sequence.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw sequence value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Sequence {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// One participant call in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseAttempt {
    pub phase: Phase,
    pub participant_id: ParticipantId,
    pub outcome: PhaseOutcome,
    /// 1-based attempt number for this participant in this phase.
    pub attempt: u32,
    /// Failure reason, if the attempt failed.
    pub reason: Option<String>,
}

/// Facts recorded in a transaction's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum LogRecord {
    /// The transaction was created.
    TransactionBegan { created_at: DateTime<Utc> },

    /// A participant joined the transaction at the given position.
    ParticipantRegistered {
        participant_id: ParticipantId,
        position: u32,
    },

    /// Commit started; registration is closed and the context is frozen.
    CommitStarted { context: ContextMap },

    /// The transaction moved between statuses.
    StatusChanged {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// A participant was called in some phase.
    PhaseAttempt(PhaseAttempt),

    /// A coordinator instance took the execution lease.
    LeaseAcquired {
        owner: String,
        expires_at: DateTime<Utc>,
    },

    /// A coordinator instance gave the execution lease back.
    LeaseReleased { owner: String },
}

impl LogRecord {
    /// Returns the record type name, used for storage and filtering.
    pub fn record_type(&self) -> &'static str {
        match self {
            LogRecord::TransactionBegan { .. } => "TransactionBegan",
            LogRecord::ParticipantRegistered { .. } => "ParticipantRegistered",
            LogRecord::CommitStarted { .. } => "CommitStarted",
            LogRecord::StatusChanged { .. } => "StatusChanged",
            LogRecord::PhaseAttempt(_) => "PhaseAttempt",
            LogRecord::LeaseAcquired { .. } => "LeaseAcquired",
            LogRecord::LeaseReleased { .. } => "LeaseReleased",
        }
    }

    /// Creates a PhaseAttempt record.
    pub fn phase_attempt(
        phase: Phase,
        participant_id: ParticipantId,
        outcome: PhaseOutcome,
        attempt: u32,
        reason: Option<String>,
    ) -> Self {
        LogRecord::PhaseAttempt(PhaseAttempt {
            phase,
            participant_id,
            outcome,
            attempt,
            reason,
        })
    }

    /// Creates a StatusChanged record.
    pub fn status_changed(from: TransactionStatus, to: TransactionStatus) -> Self {
        LogRecord::StatusChanged { from, to }
    }
}

/// An immutable entry in the transaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: EntryId,
    pub transaction_id: TransactionId,
    pub sequence: Sequence,
    pub timestamp: DateTime<Utc>,
    pub record: LogRecord,
}

impl LogEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(transaction_id: TransactionId, sequence: Sequence, record: LogRecord) -> Self {
        Self {
            entry_id: EntryId::new(),
            transaction_id,
            sequence,
            timestamp: Utc::now(),
            record,
        }
    }

    /// Returns the phase attempt carried by this entry, if any.
    pub fn phase_attempt(&self) -> Option<&PhaseAttempt> {
        match &self.record {
            LogRecord::PhaseAttempt(attempt) => Some(attempt),
            _ => None,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase_attempt().map(|a| a.phase)
    }

    pub fn participant_id(&self) -> Option<&ParticipantId> {
        match &self.record {
            LogRecord::PhaseAttempt(attempt) => Some(&attempt.participant_id),
            LogRecord::ParticipantRegistered { participant_id, .. } => Some(participant_id),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<PhaseOutcome> {
        self.phase_attempt().map(|a| a.outcome)
    }

    pub fn attempt(&self) -> Option<u32> {
        self.phase_attempt().map(|a| a.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_ordering() {
        assert!(Sequence::initial() < Sequence::first());
        assert_eq!(Sequence::initial().next(), Sequence::first());
        assert_eq!(Sequence::new(7).as_i64(), 7);
    }

    #[test]
    fn test_record_type() {
        assert_eq!(
            LogRecord::TransactionBegan {
                created_at: Utc::now()
            }
            .record_type(),
            "TransactionBegan"
        );
        assert_eq!(
            LogRecord::status_changed(TransactionStatus::Trying, TransactionStatus::Confirming)
                .record_type(),
            "StatusChanged"
        );
        assert_eq!(
            LogRecord::phase_attempt(
                Phase::Try,
                ParticipantId::from("account"),
                PhaseOutcome::Success,
                1,
                None
            )
            .record_type(),
            "PhaseAttempt"
        );
    }

    #[test]
    fn test_phase_attempt_accessors() {
        let entry = LogEntry::new(
            TransactionId::new(),
            Sequence::first(),
            LogRecord::phase_attempt(
                Phase::Confirm,
                ParticipantId::from("inventory"),
                PhaseOutcome::Failed,
                2,
                Some("timeout".to_string()),
            ),
        );

        assert_eq!(entry.phase(), Some(Phase::Confirm));
        assert_eq!(entry.participant_id(), Some(&ParticipantId::from("inventory")));
        assert_eq!(entry.outcome(), Some(PhaseOutcome::Failed));
        assert_eq!(entry.attempt(), Some(2));
    }

    #[test]
    fn test_non_phase_entries_have_no_phase_fields() {
        let entry = LogEntry::new(
            TransactionId::new(),
            Sequence::first(),
            LogRecord::LeaseReleased {
                owner: "node-a".to_string(),
            },
        );
        assert!(entry.phase().is_none());
        assert!(entry.outcome().is_none());
        assert!(entry.participant_id().is_none());
    }

    #[test]
    fn test_record_json_shape() {
        let record = LogRecord::phase_attempt(
            Phase::Try,
            ParticipantId::from("order"),
            PhaseOutcome::Success,
            1,
            None,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "PhaseAttempt");
        assert_eq!(json["data"]["phase"], "TRY");
        assert_eq!(json["data"]["participant_id"], "order");
        assert_eq!(json["data"]["outcome"], "SUCCESS");

        let back: LogRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
