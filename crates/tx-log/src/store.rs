use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::{
    LogEntry, LogError, LogQuery, LogRecord, Phase, Result, Sequence, TransactionId,
};

/// Options for appending records to the log.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected last sequence of the transaction for optimistic concurrency.
    /// If None, the records are appended after whatever is there.
    pub expected_sequence: Option<Sequence>,
}

impl AppendOptions {
    /// Creates options with no sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the transaction log to end at `sequence`.
    pub fn expect_sequence(sequence: Sequence) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Creates options expecting the transaction to have no entries yet.
    pub fn expect_new() -> Self {
        Self {
            expected_sequence: Some(Sequence::initial()),
        }
    }
}

/// A stream of log entries.
pub type EntryStream = Pin<Box<dyn Stream<Item = Result<LogEntry>> + Send>>;

/// Durable, append-only log of transaction facts.
///
/// Used both as an audit trail and as the source of truth for crash
/// recovery. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait TransactionLog: Send + Sync {
    /// Appends records to a transaction's log.
    ///
    /// Records are appended atomically and receive consecutive sequences.
    /// If `options.expected_sequence` is set, the append fails with
    /// `SequenceConflict` when the log ends at a different sequence.
    ///
    /// Returns the sequence of the last appended entry.
    async fn append(
        &self,
        transaction_id: TransactionId,
        records: Vec<LogRecord>,
        options: AppendOptions,
    ) -> Result<Sequence>;

    /// Retrieves every entry of a transaction in sequence order.
    async fn read_all(&self, transaction_id: TransactionId) -> Result<Vec<LogEntry>>;

    /// Retrieves a transaction's entries starting at `from` (inclusive).
    async fn read_from(&self, transaction_id: TransactionId, from: Sequence)
    -> Result<Vec<LogEntry>>;

    /// Lists every transaction that has entries, oldest first.
    async fn list_transactions(&self) -> Result<Vec<TransactionId>>;

    /// Retrieves entries matching a query, ordered by timestamp then sequence.
    async fn query(&self, query: LogQuery) -> Result<Vec<LogEntry>>;

    /// Streams every entry in the log in insertion order.
    async fn stream_all(&self) -> Result<EntryStream>;

    /// Returns the last sequence of a transaction, or None if it has no entries.
    async fn last_sequence(&self, transaction_id: TransactionId) -> Result<Option<Sequence>>;
}

/// Convenience methods available on every transaction log.
#[async_trait]
pub trait TransactionLogExt: TransactionLog {
    /// Appends a single record without a sequence check.
    async fn append_record(
        &self,
        transaction_id: TransactionId,
        record: LogRecord,
    ) -> Result<Sequence> {
        self.append(transaction_id, vec![record], AppendOptions::new())
            .await
    }

    /// Checks if a transaction has any entries.
    async fn transaction_exists(&self, transaction_id: TransactionId) -> Result<bool> {
        Ok(self.last_sequence(transaction_id).await?.is_some())
    }

    /// Retrieves the phase attempts of one phase for a transaction.
    async fn phase_entries(
        &self,
        transaction_id: TransactionId,
        phase: Phase,
    ) -> Result<Vec<LogEntry>> {
        Ok(self
            .read_all(transaction_id)
            .await?
            .into_iter()
            .filter(|e| e.phase() == Some(phase))
            .collect())
    }
}

impl<T: TransactionLog + ?Sized> TransactionLogExt for T {}

/// Validates records before appending.
pub fn validate_records(records: &[LogRecord]) -> Result<()> {
    if records.is_empty() {
        return Err(LogError::InvalidAppend(
            "Cannot append empty record list".to_string(),
        ));
    }

    for record in records {
        if let LogRecord::PhaseAttempt(attempt) = record
            && attempt.attempt == 0
        {
            return Err(LogError::InvalidAppend(format!(
                "Attempt numbers start at 1 (participant {})",
                attempt.participant_id
            )));
        }
    }

    Ok(())
}
