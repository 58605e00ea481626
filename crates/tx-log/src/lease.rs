//! Execution leases recorded in the transaction log.
//!
//! A lease gives one coordinator instance the exclusive right to drive a
//! transaction. Leases are ordinary log records; acquisition is a
//! conditional append at the sequence that was read, so two instances racing
//! for the same transaction cannot both win.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    AppendOptions, LogEntry, LogError, LogRecord, Result, Sequence, TransactionId, TransactionLog,
};

/// The lease currently recorded for a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLease {
    pub transaction_id: TransactionId,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Sequence of the `LeaseAcquired` entry.
    pub sequence: Sequence,
}

impl ExecutionLease {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_held_by(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// Returns the lease in force at the end of `entries`, if any.
///
/// Expiry is not checked here; a released lease yields None.
pub fn current_lease(entries: &[LogEntry]) -> Option<ExecutionLease> {
    let mut lease = None;
    for entry in entries {
        match &entry.record {
            LogRecord::LeaseAcquired { owner, expires_at } => {
                lease = Some(ExecutionLease {
                    transaction_id: entry.transaction_id,
                    owner: owner.clone(),
                    acquired_at: entry.timestamp,
                    expires_at: *expires_at,
                    sequence: entry.sequence,
                });
            }
            LogRecord::LeaseReleased { owner } => {
                if lease.as_ref().is_some_and(|l| &l.owner == owner) {
                    lease = None;
                }
            }
            _ => {}
        }
    }
    lease
}

/// Acquires (or renews) the execution lease for `owner`.
///
/// Fails with `LeaseHeld` if another owner holds an unexpired lease, and with
/// `SequenceConflict` if the log moved between the read and the append.
pub async fn acquire_lease<L>(
    log: &L,
    transaction_id: TransactionId,
    owner: &str,
    ttl: Duration,
) -> Result<ExecutionLease>
where
    L: TransactionLog + ?Sized,
{
    let entries = log.read_all(transaction_id).await?;
    let now = Utc::now();

    if let Some(lease) = current_lease(&entries)
        && !lease.is_held_by(owner)
        && !lease.is_expired_at(now)
    {
        return Err(LogError::LeaseHeld {
            transaction_id,
            owner: lease.owner,
            expires_at: lease.expires_at,
        });
    }

    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| LogError::InvalidAppend(format!("lease ttl out of range: {e}")))?;
    let expires_at = now + ttl;
    let last = entries
        .last()
        .map(|e| e.sequence)
        .unwrap_or(Sequence::initial());

    let sequence = log
        .append(
            transaction_id,
            vec![LogRecord::LeaseAcquired {
                owner: owner.to_string(),
                expires_at,
            }],
            AppendOptions::expect_sequence(last),
        )
        .await?;

    tracing::debug!(%transaction_id, owner, %expires_at, "execution lease acquired");

    Ok(ExecutionLease {
        transaction_id,
        owner: owner.to_string(),
        acquired_at: now,
        expires_at,
        sequence,
    })
}

/// Releases the lease held by `owner`.
///
/// Returns the sequence of the `LeaseReleased` entry, or None if `owner` held
/// no lease and nothing was written.
pub async fn release_lease<L>(
    log: &L,
    transaction_id: TransactionId,
    owner: &str,
) -> Result<Option<Sequence>>
where
    L: TransactionLog + ?Sized,
{
    let entries = log.read_all(transaction_id).await?;
    if !current_lease(&entries).is_some_and(|l| l.is_held_by(owner)) {
        return Ok(None);
    }

    let sequence = log
        .append(
            transaction_id,
            vec![LogRecord::LeaseReleased {
                owner: owner.to_string(),
            }],
            AppendOptions::new(),
        )
        .await?;

    tracing::debug!(%transaction_id, owner, "execution lease released");
    Ok(Some(sequence))
}
