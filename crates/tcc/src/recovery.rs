//! Crash recovery by replaying the transaction log.

use chrono::{DateTime, Utc};
use common::{TransactionId, TransactionStatus};
use tx_log::{TransactionLog, current_lease};

use crate::context::TransactionContext;
use crate::coordinator::TransactionCoordinator;
use crate::error::{Result, TccError};

/// What a recovery pass did.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Transactions driven to a terminal status, with that status.
    pub resumed: Vec<(TransactionId, TransactionStatus)>,
    /// Transactions left alone because another driver holds them.
    pub skipped: Vec<TransactionId>,
    /// Transactions that could not be resumed, with the reason.
    pub failed: Vec<(TransactionId, String)>,
    /// Terminal transactions loaded into the registry.
    pub loaded: usize,
}

impl<L: TransactionLog + 'static> TransactionCoordinator<L> {
    /// Rebuilds every transaction from the log and finishes the unfinished ones.
    ///
    /// - `Trying` and sealed: Try resumes at the first participant without a
    ///   Try success.
    /// - `Trying` but never committed: once older than the lease expiry the
    ///   caller is taken to be gone and the transaction is canceled. Younger
    ///   ones may still be filled in by the instance that began them and are
    ///   skipped.
    /// - `Confirming` / `Canceling`: the phase resumes for participants that
    ///   have not succeeded in it. Attempt numbers continue from the log.
    /// - `Stuck` and other terminal statuses are only loaded.
    ///
    /// Transactions leased by another live instance are skipped. Participants
    /// named in the log must be [`enlist`](Self::enlist)ed beforehand.
    #[tracing::instrument(skip(self), fields(instance_id = %self.inner.config.instance_id))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for transaction_id in self.inner.log.list_transactions().await? {
            if self.inner.is_active(transaction_id) {
                report.skipped.push(transaction_id);
                continue;
            }

            let entries = self.inner.log.read_all(transaction_id).await?;
            let Some(context) = TransactionContext::from_entries(&entries) else {
                continue;
            };
            let status = context.status();
            let open = status == TransactionStatus::Trying && !context.is_sealed();
            let created_at = context.created_at();
            // The context map of an open transaction begun here only lives in the registry
            if !open || self.inner.registry.get(transaction_id).await.is_none() {
                self.inner.registry.insert(context).await;
            }

            if status.is_terminal() {
                report.loaded += 1;
                continue;
            }

            if open && !self.is_abandoned(created_at) {
                tracing::debug!(%transaction_id, %created_at, "transaction not committed yet, skipping");
                report.skipped.push(transaction_id);
                continue;
            }

            if let Some(lease) = current_lease(&entries)
                && !lease.is_held_by(&self.inner.config.instance_id)
                && !lease.is_expired_at(Utc::now())
            {
                tracing::info!(%transaction_id, owner = %lease.owner, "transaction leased elsewhere, skipping");
                report.skipped.push(transaction_id);
                continue;
            }

            match self.resume(transaction_id).await {
                Ok(status) => {
                    tracing::info!(%transaction_id, %status, "transaction recovered");
                    report.resumed.push((transaction_id, status));
                }
                Err(TccError::LeaseHeld { .. } | TccError::AlreadyActive(_)) => {
                    report.skipped.push(transaction_id);
                }
                Err(error) => {
                    tracing::warn!(%transaction_id, %error, "failed to recover transaction");
                    report.failed.push((transaction_id, error.to_string()));
                }
            }
        }

        tracing::info!(
            resumed = report.resumed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "recovery finished"
        );
        Ok(report)
    }

    /// An uncommitted transaction older than the lease expiry has lost its caller.
    fn is_abandoned(&self, created_at: DateTime<Utc>) -> bool {
        chrono::Duration::from_std(self.inner.config.lease_expiry)
            .is_ok_and(|expiry| created_at + expiry <= Utc::now())
    }

    async fn resume(&self, transaction_id: TransactionId) -> Result<TransactionStatus> {
        let _active = self.inner.activate(transaction_id)?;

        let prepared: Result<()> = async {
            let context = self.inner.claim_for(transaction_id).await?;
            if context.status() == TransactionStatus::Trying && !context.is_sealed() {
                self.inner
                    .transition(transaction_id, TransactionStatus::Canceling)
                    .await?;
            }
            Ok(())
        }
        .await;
        if let Err(error) = prepared {
            self.inner.release(transaction_id).await;
            return Err(error);
        }

        self.inner.drive_leased(transaction_id).await
    }
}
