//! Transaction context, rebuilt from log records.

use chrono::{DateTime, Utc};
use common::{ParticipantId, Phase, PhaseOutcome, TransactionId, TransactionStatus};
use serde::{Deserialize, Serialize};
use tx_log::{ContextMap, LogEntry, LogRecord, Sequence};

/// Outcome of one participant in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub participant_id: ParticipantId,
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ParticipantRecord {
    fn pending(participant_id: ParticipantId, phase: Phase) -> Self {
        Self {
            participant_id,
            phase,
            outcome: PhaseOutcome::Pending,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }
}

/// State of one transaction as seen by the coordinator.
///
/// Every change is made by applying a [`LogRecord`], the same record the
/// coordinator appends to the transaction log, so replaying the log rebuilds
/// an identical context after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    transaction_id: TransactionId,
    status: TransactionStatus,
    created_at: DateTime<Utc>,
    context: ContextMap,
    participants: Vec<ParticipantId>,
    records: Vec<ParticipantRecord>,
    /// Commit has started; registration and context edits are closed.
    sealed: bool,
    /// Status a `Stuck` transaction was in when it got stuck.
    stuck_from: Option<TransactionStatus>,
    last_sequence: Sequence,
}

impl TransactionContext {
    /// Creates a fresh context in `Trying`.
    pub fn new(transaction_id: TransactionId, created_at: DateTime<Utc>) -> Self {
        Self {
            transaction_id,
            status: TransactionStatus::Trying,
            created_at,
            context: ContextMap::new(),
            participants: Vec::new(),
            records: Vec::new(),
            sealed: false,
            stuck_from: None,
            last_sequence: Sequence::initial(),
        }
    }

    /// Rebuilds a context by replaying a transaction's log entries.
    ///
    /// Returns None if there are no entries.
    pub fn from_entries(entries: &[LogEntry]) -> Option<Self> {
        let first = entries.first()?;
        let mut context = Self::new(first.transaction_id, first.timestamp);
        for entry in entries {
            context.apply(entry);
        }
        Some(context)
    }

    /// Applies a logged entry.
    pub fn apply(&mut self, entry: &LogEntry) {
        self.apply_record(&entry.record, entry.timestamp);
        self.last_sequence = self.last_sequence.max(entry.sequence);
    }

    /// Applies a record that happened at `at`.
    pub fn apply_record(&mut self, record: &LogRecord, at: DateTime<Utc>) {
        match record {
            LogRecord::TransactionBegan { created_at } => {
                self.created_at = *created_at;
            }
            LogRecord::ParticipantRegistered { participant_id, .. } => {
                if !self.participants.contains(participant_id) {
                    self.participants.push(participant_id.clone());
                    self.records
                        .push(ParticipantRecord::pending(participant_id.clone(), Phase::Try));
                }
            }
            LogRecord::CommitStarted { context } => {
                self.context = context.clone();
                self.sealed = true;
            }
            LogRecord::StatusChanged { from, to } => {
                match to {
                    TransactionStatus::Stuck => self.stuck_from = Some(*from),
                    TransactionStatus::Confirming => self.open_phase(Phase::Confirm),
                    TransactionStatus::Canceling => self.open_phase(Phase::Cancel),
                    _ => {}
                }
                if *from == TransactionStatus::Stuck {
                    self.stuck_from = None;
                }
                self.status = *to;
            }
            LogRecord::PhaseAttempt(attempt) => {
                let record = self.record_mut(&attempt.participant_id, attempt.phase);
                record.outcome = attempt.outcome;
                record.attempts = record.attempts.max(attempt.attempt);
                record.last_attempt_at = Some(at);
                record.last_error = attempt.reason.clone();
            }
            LogRecord::LeaseAcquired { .. } | LogRecord::LeaseReleased { .. } => {
                // Leases are read straight from the log
            }
        }
    }

    /// Adds pending records for the participants a phase will call.
    fn open_phase(&mut self, phase: Phase) {
        let targets: Vec<ParticipantId> = match phase {
            Phase::Cancel => self
                .participants
                .iter()
                .filter(|p| self.outcome(p, Phase::Try) == PhaseOutcome::Success)
                .cloned()
                .collect(),
            _ => self.participants.clone(),
        };
        for participant_id in targets {
            self.record_mut(&participant_id, phase);
        }
    }

    fn record_mut(&mut self, participant_id: &ParticipantId, phase: Phase) -> &mut ParticipantRecord {
        let index = match self
            .records
            .iter()
            .position(|r| &r.participant_id == participant_id && r.phase == phase)
        {
            Some(index) => index,
            None => {
                self.records
                    .push(ParticipantRecord::pending(participant_id.clone(), phase));
                self.records.len() - 1
            }
        };
        &mut self.records[index]
    }

    /// Sets a context entry. Callers must check [`is_sealed`](Self::is_sealed) first.
    pub(crate) fn insert_context(&mut self, key: String, value: serde_json::Value) {
        self.context.insert(key, value);
    }
}

// Query methods
impl TransactionContext {
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn context(&self) -> &ContextMap {
        &self.context
    }

    /// Participants in registration order.
    pub fn participants(&self) -> &[ParticipantId] {
        &self.participants
    }

    pub fn records(&self) -> &[ParticipantRecord] {
        &self.records
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn stuck_from(&self) -> Option<TransactionStatus> {
        self.stuck_from
    }

    pub fn last_sequence(&self) -> Sequence {
        self.last_sequence
    }

    pub fn has_participant(&self, participant_id: &ParticipantId) -> bool {
        self.participants.contains(participant_id)
    }

    pub fn record(&self, participant_id: &ParticipantId, phase: Phase) -> Option<&ParticipantRecord> {
        self.records
            .iter()
            .find(|r| &r.participant_id == participant_id && r.phase == phase)
    }

    /// Outcome of a participant in a phase; `Pending` if it was never called.
    pub fn outcome(&self, participant_id: &ParticipantId, phase: Phase) -> PhaseOutcome {
        self.record(participant_id, phase)
            .map(|r| r.outcome)
            .unwrap_or_default()
    }

    /// Number of attempts made so far for a participant in a phase.
    pub fn attempts(&self, participant_id: &ParticipantId, phase: Phase) -> u32 {
        self.record(participant_id, phase)
            .map(|r| r.attempts)
            .unwrap_or(0)
    }

    /// Participants a Cancel must reach, in reverse registration order.
    pub fn cancel_targets(&self) -> Vec<ParticipantId> {
        self.participants
            .iter()
            .rev()
            .filter(|p| self.outcome(p, Phase::Try) == PhaseOutcome::Success)
            .cloned()
            .collect()
    }

    /// Returns a plain status report.
    pub fn report(&self) -> StatusReport {
        StatusReport {
            transaction_id: self.transaction_id,
            status: self.status,
            created_at: self.created_at,
            records: self.records.clone(),
        }
    }
}

/// Answer to a status query: the transaction status and every participant record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub records: Vec<ParticipantRecord>,
}

impl StatusReport {
    /// Records of one phase, in the order they were opened.
    pub fn phase_records(&self, phase: Phase) -> Vec<&ParticipantRecord> {
        self.records.iter().filter(|r| r.phase == phase).collect()
    }

    pub fn outcome(&self, participant_id: &ParticipantId, phase: Phase) -> PhaseOutcome {
        self.records
            .iter()
            .find(|r| &r.participant_id == participant_id && r.phase == phase)
            .map(|r| r.outcome)
            .unwrap_or_default()
    }
}
