//! Account participant: freezes funds in Try, debits them in Confirm.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ParticipantId, Phase, TransactionId};
use tx_log::{ContextMap, IdempotencyStore};

use super::{FaultInjector, PhaseLedger, context_quantity, context_str};
use crate::config::DEFAULT_LEASE_EXPIRY;
use crate::participant::{Participant, ParticipantError, PhaseResult};

#[derive(Debug, Clone)]
struct Freeze {
    account: String,
    amount: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Ledger {
    balances: HashMap<String, i64>,
    frozen: HashMap<TransactionId, Freeze>,
}

impl Ledger {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.frozen.retain(|_, freeze| freeze.expires_at > now);
    }

    fn frozen_on(&self, account: &str) -> i64 {
        self.frozen
            .values()
            .filter(|f| f.account == account)
            .map(|f| f.amount)
            .sum()
    }
}

/// Holds account balances.
///
/// Reads `account` and `amount` from the transaction context.
pub struct AccountParticipant {
    id: ParticipantId,
    idempotency: Arc<dyn IdempotencyStore>,
    reservation_lease: Duration,
    faults: FaultInjector,
    ledger: Mutex<Ledger>,
}

impl AccountParticipant {
    pub fn new(idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            id: ParticipantId::from("account"),
            idempotency,
            reservation_lease: DEFAULT_LEASE_EXPIRY,
            faults: FaultInjector::new(),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Sets how long a freeze lives before it lapses on its own.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.reservation_lease = lease;
        self
    }

    pub fn with_balance(self, account: impl Into<String>, balance: i64) -> Self {
        self.ledger().balances.insert(account.into(), balance);
        self
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn balance(&self, account: &str) -> Option<i64> {
        self.ledger().balances.get(account).copied()
    }

    /// Balance minus live freezes.
    pub fn available(&self, account: &str) -> Option<i64> {
        let mut ledger = self.ledger();
        ledger.purge_expired(Utc::now());
        let balance = ledger.balances.get(account).copied()?;
        Some(balance - ledger.frozen_on(account))
    }

    pub fn frozen_count(&self) -> usize {
        self.ledger().frozen.len()
    }
}

#[async_trait]
impl Participant for AccountParticipant {
    fn participant_id(&self) -> ParticipantId {
        self.id.clone()
    }

    async fn try_execute(&self, transaction_id: TransactionId, context: &ContextMap) -> PhaseResult {
        self.faults.enter(Phase::Try).await?;
        let ledger = PhaseLedger::new(self.idempotency.as_ref(), transaction_id, &self.id);
        if ledger.is_done(Phase::Try).await? {
            return Ok(());
        }
        ledger.ensure_not_canceled().await?;

        let account = context_str(context, "account")?;
        let amount = context_quantity(context, "amount")?;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.reservation_lease)
                .map_err(|e| ParticipantError::rejected(format!("invalid lease: {e}")))?;

        {
            let mut state = self.ledger();
            state.purge_expired(now);
            let balance = state
                .balances
                .get(account)
                .copied()
                .ok_or_else(|| ParticipantError::rejected(format!("unknown account {account}")))?;
            let available = balance - state.frozen_on(account);
            if available < amount {
                return Err(ParticipantError::rejected(format!(
                    "insufficient funds in {account}: {available} available, {amount} requested"
                )));
            }
            state.frozen.insert(
                transaction_id,
                Freeze {
                    account: account.to_string(),
                    amount,
                    expires_at,
                },
            );
        }

        tracing::debug!(%transaction_id, account, amount, "funds frozen");
        ledger.mark_done(Phase::Try).await
    }

    async fn confirm_execute(&self, transaction_id: TransactionId) -> PhaseResult {
        self.faults.enter(Phase::Confirm).await?;
        let ledger = PhaseLedger::new(self.idempotency.as_ref(), transaction_id, &self.id);
        if ledger.is_done(Phase::Confirm).await? {
            return Ok(());
        }

        {
            let mut state = self.ledger();
            let freeze = state
                .frozen
                .remove(&transaction_id)
                .filter(|f| f.expires_at > Utc::now())
                .ok_or_else(|| {
                    ParticipantError::rejected(format!(
                        "no live freeze for transaction {transaction_id}"
                    ))
                })?;
            if let Some(balance) = state.balances.get_mut(&freeze.account) {
                *balance -= freeze.amount;
            }
        }

        ledger.mark_done(Phase::Confirm).await
    }

    async fn cancel_execute(&self, transaction_id: TransactionId) -> PhaseResult {
        self.faults.enter(Phase::Cancel).await?;
        let ledger = PhaseLedger::new(self.idempotency.as_ref(), transaction_id, &self.id);
        if ledger.is_done(Phase::Cancel).await? {
            return Ok(());
        }

        let released = self.ledger().frozen.remove(&transaction_id).is_some();
        if !released {
            tracing::debug!(%transaction_id, "cancel without freeze, nothing to release");
        }

        ledger.mark_done(Phase::Cancel).await
    }
}

#[cfg(test)]
mod tests {
    use tx_log::InMemoryIdempotencyStore;

    use super::*;

    fn account() -> AccountParticipant {
        AccountParticipant::new(Arc::new(InMemoryIdempotencyStore::new())).with_balance("alice", 100)
    }

    fn context(amount: i64) -> ContextMap {
        let mut context = ContextMap::new();
        context.insert("account".to_string(), serde_json::json!("alice"));
        context.insert("amount".to_string(), serde_json::json!(amount));
        context
    }

    #[tokio::test]
    async fn test_try_then_confirm_debits() {
        let participant = account();
        let tx = TransactionId::new();

        participant.try_execute(tx, &context(40)).await.unwrap();
        assert_eq!(participant.available("alice"), Some(60));
        assert_eq!(participant.balance("alice"), Some(100));

        participant.confirm_execute(tx).await.unwrap();
        assert_eq!(participant.balance("alice"), Some(60));
        assert_eq!(participant.frozen_count(), 0);
    }

    #[tokio::test]
    async fn test_confirm_twice_debits_once() {
        let participant = account();
        let tx = TransactionId::new();
        participant.try_execute(tx, &context(40)).await.unwrap();

        participant.confirm_execute(tx).await.unwrap();
        participant.confirm_execute(tx).await.unwrap();
        assert_eq!(participant.balance("alice"), Some(60));
    }

    #[tokio::test]
    async fn test_try_twice_freezes_once() {
        let participant = account();
        let tx = TransactionId::new();

        participant.try_execute(tx, &context(40)).await.unwrap();
        participant.try_execute(tx, &context(40)).await.unwrap();
        assert_eq!(participant.available("alice"), Some(60));
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejected() {
        let participant = account();
        let result = participant.try_execute(TransactionId::new(), &context(150)).await;
        assert!(matches!(result, Err(ParticipantError::Rejected(_))));
        assert_eq!(participant.frozen_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_freeze() {
        let participant = account();
        let tx = TransactionId::new();
        participant.try_execute(tx, &context(40)).await.unwrap();

        participant.cancel_execute(tx).await.unwrap();
        assert_eq!(participant.available("alice"), Some(100));
        assert_eq!(participant.balance("alice"), Some(100));
    }

    #[tokio::test]
    async fn test_null_compensation_blocks_late_try() {
        let participant = account();
        let tx = TransactionId::new();

        participant.cancel_execute(tx).await.unwrap();
        let late = participant.try_execute(tx, &context(40)).await;

        assert!(matches!(late, Err(ParticipantError::Rejected(_))));
        assert_eq!(participant.frozen_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_freeze_cannot_be_confirmed() {
        let participant = account().with_lease(Duration::from_millis(10));
        let tx = TransactionId::new();
        participant.try_execute(tx, &context(40)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(participant.available("alice"), Some(100));
        assert!(matches!(
            participant.confirm_execute(tx).await,
            Err(ParticipantError::Rejected(_))
        ));
        assert_eq!(participant.balance("alice"), Some(100));
    }
}
