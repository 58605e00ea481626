use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    LogEntry, LogError, LogQuery, LogRecord, Result, Sequence, TransactionId,
    store::{AppendOptions, EntryStream, TransactionLog, validate_records},
};

#[derive(Default)]
struct LogState {
    entries: Vec<LogEntry>,
    heads: HashMap<TransactionId, Sequence>,
    transactions: Vec<TransactionId>,
}

/// In-memory transaction log.
///
/// Provides the same interface as the PostgreSQL implementation. Clones share
/// the same underlying log, so a "restarted" coordinator can be handed a
/// clone to replay what its predecessor wrote.
#[derive(Clone, Default)]
pub struct InMemoryTransactionLog {
    state: Arc<RwLock<LogState>>,
}

impl InMemoryTransactionLog {
    /// Creates a new empty in-memory log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of entries stored.
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Clears all entries.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.heads.clear();
        state.transactions.clear();
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn append(
        &self,
        transaction_id: TransactionId,
        records: Vec<LogRecord>,
        options: AppendOptions,
    ) -> Result<Sequence> {
        validate_records(&records)?;

        let mut state = self.state.write().await;
        let current = state
            .heads
            .get(&transaction_id)
            .copied()
            .unwrap_or(Sequence::initial());

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(LogError::SequenceConflict {
                transaction_id,
                expected,
                actual: current,
            });
        }

        if current == Sequence::initial() {
            state.transactions.push(transaction_id);
        }

        let count = records.len() as u64;
        let mut sequence = current;
        for record in records {
            sequence = sequence.next();
            state
                .entries
                .push(LogEntry::new(transaction_id, sequence, record));
        }
        state.heads.insert(transaction_id, sequence);

        metrics::counter!("tx_log_appends_total").increment(count);
        Ok(sequence)
    }

    async fn read_all(&self, transaction_id: TransactionId) -> Result<Vec<LogEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn read_from(
        &self,
        transaction_id: TransactionId,
        from: Sequence,
    ) -> Result<Vec<LogEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .filter(|e| e.transaction_id == transaction_id && e.sequence >= from)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn list_transactions(&self) -> Result<Vec<TransactionId>> {
        Ok(self.state.read().await.transactions.clone())
    }

    async fn query(&self, query: LogQuery) -> Result<Vec<LogEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();

        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });

        let offset = query.offset.unwrap_or(0);
        let entries = entries.into_iter().skip(offset);
        let entries: Vec<_> = match query.limit {
            Some(limit) => entries.take(limit).collect(),
            None => entries.collect(),
        };

        Ok(entries)
    }

    async fn stream_all(&self) -> Result<EntryStream> {
        use futures_util::stream;

        let entries = self.state.read().await.entries.clone();
        let stream = stream::iter(entries.into_iter().map(Ok));
        Ok(Box::pin(stream))
    }

    async fn last_sequence(&self, transaction_id: TransactionId) -> Result<Option<Sequence>> {
        Ok(self.state.read().await.heads.get(&transaction_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{ParticipantId, Phase, PhaseOutcome, TransactionLogExt, TransactionStatus};

    fn began() -> LogRecord {
        LogRecord::TransactionBegan {
            created_at: Utc::now(),
        }
    }

    fn attempt(participant: &str, phase: Phase, outcome: PhaseOutcome, n: u32) -> LogRecord {
        LogRecord::phase_attempt(phase, ParticipantId::from(participant), outcome, n, None)
    }

    #[tokio::test]
    async fn append_single_record() {
        let log = InMemoryTransactionLog::new();
        let tx = TransactionId::new();

        let result = log.append(tx, vec![began()], AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), Sequence::first());

        let entries = log.read_all(tx).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sequence, Sequence::first());
    }

    #[tokio::test]
    async fn append_batch_assigns_consecutive_sequences() {
        let log = InMemoryTransactionLog::new();
        let tx = TransactionId::new();

        let last = log
            .append(
                tx,
                vec![
                    began(),
                    attempt("account", Phase::Try, PhaseOutcome::Success, 1),
                    attempt("order", Phase::Try, PhaseOutcome::Success, 1),
                ],
                AppendOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(last, Sequence::new(3));

        let sequences: Vec<_> = log
            .read_all(tx)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence.as_i64())
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sequence_conflict_on_stale_expectation() {
        let log = InMemoryTransactionLog::new();
        let tx = TransactionId::new();
        log.append(tx, vec![began()], AppendOptions::expect_new())
            .await
            .unwrap();

        let result = log
            .append(
                tx,
                vec![attempt("account", Phase::Try, PhaseOutcome::Success, 1)],
                AppendOptions::expect_new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(LogError::SequenceConflict { actual, .. }) if actual == Sequence::first()
        ));
        assert_eq!(log.entry_count().await, 1);
    }

    #[tokio::test]
    async fn sequences_are_per_transaction() {
        let log = InMemoryTransactionLog::new();
        let tx1 = TransactionId::new();
        let tx2 = TransactionId::new();

        log.append_record(tx1, began()).await.unwrap();
        log.append_record(tx1, began()).await.unwrap();
        let seq = log.append_record(tx2, began()).await.unwrap();

        assert_eq!(seq, Sequence::first());
        assert_eq!(log.last_sequence(tx1).await.unwrap(), Some(Sequence::new(2)));
        assert_eq!(log.list_transactions().await.unwrap(), vec![tx1, tx2]);
    }

    #[tokio::test]
    async fn read_from_sequence() {
        let log = InMemoryTransactionLog::new();
        let tx = TransactionId::new();
        log.append(
            tx,
            vec![
                began(),
                LogRecord::status_changed(TransactionStatus::Trying, TransactionStatus::Confirming),
                LogRecord::status_changed(
                    TransactionStatus::Confirming,
                    TransactionStatus::Confirmed,
                ),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

        let tail = log.read_from(tx, Sequence::new(2)).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, Sequence::new(2));
    }

    #[tokio::test]
    async fn query_by_phase_and_outcome() {
        let log = InMemoryTransactionLog::new();
        let tx = TransactionId::new();
        log.append(
            tx,
            vec![
                attempt("account", Phase::Confirm, PhaseOutcome::Failed, 1),
                attempt("account", Phase::Confirm, PhaseOutcome::Failed, 2),
                attempt("account", Phase::Confirm, PhaseOutcome::Success, 3),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

        let failed = log
            .query(
                LogQuery::for_transaction(tx)
                    .phase(Phase::Confirm)
                    .outcome(PhaseOutcome::Failed),
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);

        let paged = log
            .query(LogQuery::for_transaction(tx).offset(1).limit(1))
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].attempt(), Some(2));
    }

    #[tokio::test]
    async fn phase_entries_filters_by_phase() {
        let log = InMemoryTransactionLog::new();
        let tx = TransactionId::new();
        log.append(
            tx,
            vec![
                began(),
                attempt("account", Phase::Try, PhaseOutcome::Success, 1),
                attempt("account", Phase::Cancel, PhaseOutcome::Success, 1),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

        let cancels = log.phase_entries(tx, Phase::Cancel).await.unwrap();
        assert_eq!(cancels.len(), 1);
        assert!(log.transaction_exists(tx).await.unwrap());
        assert!(!log.transaction_exists(TransactionId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn stream_all_entries() {
        use futures_util::StreamExt;

        let log = InMemoryTransactionLog::new();
        log.append_record(TransactionId::new(), began()).await.unwrap();
        log.append_record(TransactionId::new(), began()).await.unwrap();

        let entries: Vec<_> = log.stream_all().await.unwrap().collect().await;
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_never_reuse_a_sequence() {
        let log = InMemoryTransactionLog::new();
        let tx = TransactionId::new();

        let mut handles = Vec::new();
        for n in 1..=20 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append_record(tx, attempt("account", Phase::Confirm, PhaseOutcome::Failed, n))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut sequences: Vec<_> = log
            .read_all(tx)
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence.as_i64())
            .collect();
        sequences.dedup();
        assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
    }
}
