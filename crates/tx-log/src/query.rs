use chrono::{DateTime, Utc};

use crate::{LogEntry, ParticipantId, Phase, PhaseOutcome, TransactionId};

/// Builder for audit queries over the transaction log.
///
/// Phase, participant and outcome filters only match `PhaseAttempt`
/// entries; other entries are excluded once any of them is set.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    /// Filter by transaction.
    pub transaction_id: Option<TransactionId>,

    /// Filter by record types (any of these types).
    pub record_types: Option<Vec<String>>,

    /// Filter by protocol phase.
    pub phase: Option<Phase>,

    /// Filter by participant.
    pub participant_id: Option<ParticipantId>,

    /// Filter by attempt outcome.
    pub outcome: Option<PhaseOutcome>,

    /// Filter by entries at or after this timestamp.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Filter by entries at or before this timestamp.
    pub to_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of entries to return.
    pub limit: Option<usize>,

    /// Number of entries to skip.
    pub offset: Option<usize>,
}

impl LogQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for a specific transaction.
    pub fn for_transaction(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            ..Default::default()
        }
    }

    pub fn transaction_id(mut self, id: TransactionId) -> Self {
        self.transaction_id = Some(id);
        self
    }

    pub fn record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_types = Some(vec![record_type.into()]);
        self
    }

    pub fn record_types(mut self, record_types: Vec<String>) -> Self {
        self.record_types = Some(record_types);
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn participant_id(mut self, participant_id: impl Into<ParticipantId>) -> Self {
        self.participant_id = Some(participant_id.into());
        self
    }

    pub fn outcome(mut self, outcome: PhaseOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the entry satisfies every filter except paging.
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(id) = self.transaction_id
            && entry.transaction_id != id
        {
            return false;
        }
        if let Some(ref types) = self.record_types
            && !types.iter().any(|t| t == entry.record.record_type())
        {
            return false;
        }
        if let Some(phase) = self.phase
            && entry.phase() != Some(phase)
        {
            return false;
        }
        if let Some(ref participant) = self.participant_id
            && (entry.phase_attempt().is_none() || entry.participant_id() != Some(participant))
        {
            return false;
        }
        if let Some(outcome) = self.outcome
            && entry.outcome() != Some(outcome)
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && entry.timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && entry.timestamp > to
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogRecord, Sequence};

    fn attempt(tx: TransactionId, participant: &str, phase: Phase, outcome: PhaseOutcome) -> LogEntry {
        LogEntry::new(
            tx,
            Sequence::first(),
            LogRecord::phase_attempt(phase, ParticipantId::from(participant), outcome, 1, None),
        )
    }

    #[test]
    fn empty_query() {
        let query = LogQuery::new();
        assert!(query.transaction_id.is_none());
        assert!(query.phase.is_none());
        assert!(query.limit.is_none());
    }

    #[test]
    fn query_builder() {
        let id = TransactionId::new();
        let query = LogQuery::for_transaction(id)
            .phase(Phase::Confirm)
            .participant_id("account")
            .outcome(PhaseOutcome::Failed)
            .limit(10)
            .offset(5);

        assert_eq!(query.transaction_id, Some(id));
        assert_eq!(query.phase, Some(Phase::Confirm));
        assert_eq!(query.participant_id, Some(ParticipantId::from("account")));
        assert_eq!(query.outcome, Some(PhaseOutcome::Failed));
        assert_eq!(query.limit, Some(10));
        assert_eq!(query.offset, Some(5));
    }

    #[test]
    fn matches_phase_attempt_filters() {
        let tx = TransactionId::new();
        let query = LogQuery::for_transaction(tx)
            .phase(Phase::Confirm)
            .participant_id("account");

        assert!(query.matches(&attempt(tx, "account", Phase::Confirm, PhaseOutcome::Success)));
        assert!(!query.matches(&attempt(tx, "account", Phase::Try, PhaseOutcome::Success)));
        assert!(!query.matches(&attempt(tx, "order", Phase::Confirm, PhaseOutcome::Success)));
        assert!(!query.matches(&attempt(
            TransactionId::new(),
            "account",
            Phase::Confirm,
            PhaseOutcome::Success
        )));
    }

    #[test]
    fn participant_filter_skips_registration_entries() {
        let tx = TransactionId::new();
        let registered = LogEntry::new(
            tx,
            Sequence::first(),
            LogRecord::ParticipantRegistered {
                participant_id: ParticipantId::from("account"),
                position: 0,
            },
        );
        assert!(!LogQuery::new().participant_id("account").matches(&registered));
        assert!(
            LogQuery::new()
                .record_type("ParticipantRegistered")
                .matches(&registered)
        );
    }
}
