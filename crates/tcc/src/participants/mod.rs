//! In-memory example participants.
//!
//! Each one keeps its resources in memory, reserves them in Try under a
//! lease that expires on its own, and records every finished phase in an
//! [`IdempotencyStore`] so repeated calls are harmless. They also handle
//! the two classic TCC hazards:
//!
//! - a Cancel that arrives with no reservation succeeds and is remembered;
//! - a Try that arrives after a Cancel for the same transaction is rejected.
//!
//! A [`FaultInjector`] lets tests make any phase fail, reject or stall.

pub mod account;
pub mod inventory;
pub mod order;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::{ParticipantId, Phase, TransactionId};
use tx_log::{ContextMap, IdempotencyKey, IdempotencyStore};

use crate::participant::{ParticipantError, PhaseResult};

pub use account::AccountParticipant;
pub use inventory::InventoryParticipant;
pub use order::{OrderParticipant, OrderState};

#[derive(Debug, Default)]
struct Faults {
    transient: HashMap<Phase, u32>,
    rejections: HashMap<Phase, String>,
    delays: HashMap<Phase, Duration>,
    calls: HashMap<Phase, u32>,
}

/// Injectable failures for the example participants.
#[derive(Debug, Default)]
pub struct FaultInjector {
    faults: Mutex<Faults>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `times` calls of `phase` fail transiently.
    pub fn fail_transiently(&self, phase: Phase, times: u32) {
        self.faults().transient.insert(phase, times);
    }

    /// Makes every call of `phase` fail with a business rejection.
    pub fn reject(&self, phase: Phase, reason: impl Into<String>) {
        self.faults().rejections.insert(phase, reason.into());
    }

    /// Delays every call of `phase`.
    pub fn delay(&self, phase: Phase, delay: Duration) {
        self.faults().delays.insert(phase, delay);
    }

    /// Removes every injected fault. Call counts are kept.
    pub fn clear(&self) {
        let mut faults = self.faults();
        faults.transient.clear();
        faults.rejections.clear();
        faults.delays.clear();
    }

    /// Number of calls made for `phase`, including failed ones.
    pub fn calls(&self, phase: Phase) -> u32 {
        self.faults().calls.get(&phase).copied().unwrap_or(0)
    }

    /// Counts the call and applies the injected fault, if any.
    pub(crate) async fn enter(&self, phase: Phase) -> PhaseResult {
        let (delay, injected) = {
            let mut faults = self.faults();
            *faults.calls.entry(phase).or_insert(0) += 1;

            let injected = if let Some(reason) = faults.rejections.get(&phase) {
                Some(ParticipantError::rejected(reason.clone()))
            } else if let Some(remaining) = faults.transient.get_mut(&phase)
                && *remaining > 0
            {
                *remaining -= 1;
                Some(ParticipantError::transient(format!("injected {phase} failure")))
            } else {
                None
            };
            (faults.delays.get(&phase).copied(), injected)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match injected {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Idempotency bookkeeping shared by the example participants.
pub(crate) struct PhaseLedger<'a> {
    store: &'a dyn IdempotencyStore,
    transaction_id: TransactionId,
    participant_id: &'a ParticipantId,
}

impl<'a> PhaseLedger<'a> {
    pub(crate) fn new(
        store: &'a dyn IdempotencyStore,
        transaction_id: TransactionId,
        participant_id: &'a ParticipantId,
    ) -> Self {
        Self {
            store,
            transaction_id,
            participant_id,
        }
    }

    fn key(&self, phase: Phase) -> IdempotencyKey {
        IdempotencyKey::new(self.transaction_id, self.participant_id.clone(), phase)
    }

    /// Returns true if `phase` already finished for this transaction.
    pub(crate) async fn is_done(&self, phase: Phase) -> Result<bool, ParticipantError> {
        self.store
            .check(&self.key(phase))
            .await
            .map_err(|e| ParticipantError::transient(format!("idempotency check failed: {e}")))
    }

    pub(crate) async fn mark_done(&self, phase: Phase) -> PhaseResult {
        self.store
            .mark(&self.key(phase))
            .await
            .map(|_| ())
            .map_err(|e| ParticipantError::transient(format!("idempotency mark failed: {e}")))
    }

    /// Rejects a Try that arrives after this transaction was canceled here.
    pub(crate) async fn ensure_not_canceled(&self) -> PhaseResult {
        if self.is_done(Phase::Cancel).await? {
            return Err(ParticipantError::rejected(format!(
                "transaction {} was already canceled",
                self.transaction_id
            )));
        }
        Ok(())
    }
}

pub(crate) fn context_str<'c>(context: &'c ContextMap, key: &str) -> Result<&'c str, ParticipantError> {
    context
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ParticipantError::rejected(format!("context is missing string `{key}`")))
}

pub(crate) fn context_quantity(context: &ContextMap, key: &str) -> Result<i64, ParticipantError> {
    match context.get(key).and_then(|v| v.as_i64()) {
        Some(value) if value > 0 => Ok(value),
        Some(value) => Err(ParticipantError::rejected(format!(
            "`{key}` must be positive, got {value}"
        ))),
        None => Err(ParticipantError::rejected(format!(
            "context is missing integer `{key}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_faults_run_out() {
        let faults = FaultInjector::new();
        faults.fail_transiently(Phase::Confirm, 2);

        assert!(faults.enter(Phase::Confirm).await.is_err());
        assert!(faults.enter(Phase::Confirm).await.is_err());
        assert!(faults.enter(Phase::Confirm).await.is_ok());
        assert!(faults.enter(Phase::Try).await.is_ok());
        assert_eq!(faults.calls(Phase::Confirm), 3);
        assert_eq!(faults.calls(Phase::Try), 1);
    }

    #[tokio::test]
    async fn test_rejection_wins_until_cleared() {
        let faults = FaultInjector::new();
        faults.reject(Phase::Try, "out of stock");

        assert_eq!(
            faults.enter(Phase::Try).await,
            Err(ParticipantError::rejected("out of stock"))
        );
        faults.clear();
        assert!(faults.enter(Phase::Try).await.is_ok());
    }

    #[test]
    fn test_context_parsing() {
        let mut context = ContextMap::new();
        context.insert("account".to_string(), serde_json::json!("alice"));
        context.insert("amount".to_string(), serde_json::json!(25));
        context.insert("quantity".to_string(), serde_json::json!(0));

        assert_eq!(context_str(&context, "account").unwrap(), "alice");
        assert_eq!(context_quantity(&context, "amount").unwrap(), 25);
        assert!(context_quantity(&context, "quantity").is_err());
        assert!(matches!(
            context_str(&context, "sku"),
            Err(ParticipantError::Rejected(_))
        ));
    }
}
