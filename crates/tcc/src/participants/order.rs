//! Order participant: creates a pending order in Try and places it in Confirm.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ParticipantId, Phase, TransactionId};
use serde::{Deserialize, Serialize};
use tx_log::{ContextMap, IdempotencyStore};

use super::{FaultInjector, PhaseLedger};
use crate::config::DEFAULT_LEASE_EXPIRY;
use crate::participant::{Participant, ParticipantError, PhaseResult};

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Placed,
    Canceled,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrderState::Pending => "PENDING",
            OrderState::Placed => "PLACED",
            OrderState::Canceled => "CANCELED",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
struct Order {
    order_ref: String,
    state: OrderState,
    expires_at: DateTime<Utc>,
}

/// Keeps orders keyed by transaction.
///
/// Reads the optional `order_ref` from the transaction context; the
/// transaction ID is used when it is absent.
pub struct OrderParticipant {
    id: ParticipantId,
    idempotency: Arc<dyn IdempotencyStore>,
    reservation_lease: Duration,
    faults: FaultInjector,
    orders: Mutex<HashMap<TransactionId, Order>>,
}

impl OrderParticipant {
    pub fn new(idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            id: ParticipantId::from("order"),
            idempotency,
            reservation_lease: DEFAULT_LEASE_EXPIRY,
            faults: FaultInjector::new(),
            orders: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.reservation_lease = lease;
        self
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<TransactionId, Order>> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    pub fn order_state(&self, transaction_id: TransactionId) -> Option<OrderState> {
        self.orders().get(&transaction_id).map(|o| o.state)
    }

    pub fn order_ref(&self, transaction_id: TransactionId) -> Option<String> {
        self.orders()
            .get(&transaction_id)
            .map(|o| o.order_ref.clone())
    }
}

#[async_trait]
impl Participant for OrderParticipant {
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

        let order_ref = context
            .get("order_ref")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| transaction_id.to_string());
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.reservation_lease)
                .map_err(|e| ParticipantError::rejected(format!("invalid lease: {e}")))?;

        self.orders().insert(
            transaction_id,
            Order {
                order_ref: order_ref.clone(),
                state: OrderState::Pending,
                expires_at,
            },
        );

        tracing::debug!(%transaction_id, order_ref, "order pending");
        ledger.mark_done(Phase::Try).await
    }

    async fn confirm_execute(&self, transaction_id: TransactionId) -> PhaseResult {
        self.faults.enter(Phase::Confirm).await?;
        let ledger = PhaseLedger::new(self.idempotency.as_ref(), transaction_id, &self.id);
        if ledger.is_done(Phase::Confirm).await? {
            return Ok(());
        }

        {
            let mut orders = self.orders();
            match orders.get_mut(&transaction_id) {
                Some(order) if order.state == OrderState::Pending && order.expires_at > Utc::now() => {
                    order.state = OrderState::Placed;
                }
                Some(order) if order.state == OrderState::Placed => {}
                Some(order) => {
                    return Err(ParticipantError::rejected(format!(
                        "order {} cannot be placed from {}",
                        order.order_ref, order.state
                    )));
                }
                None => {
                    return Err(ParticipantError::rejected(format!(
                        "no order for transaction {transaction_id}"
                    )));
                }
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

        {
            let mut orders = self.orders();
            match orders.get_mut(&transaction_id) {
                Some(order) => order.state = OrderState::Canceled,
                None => tracing::debug!(%transaction_id, "cancel without order, nothing to release"),
            }
        }
        ledger.mark_done(Phase::Cancel).await
    }
}

#[cfg(test)]
mod tests {
    use tx_log::InMemoryIdempotencyStore;

    use super::*;

    fn order() -> OrderParticipant {
        OrderParticipant::new(Arc::new(InMemoryIdempotencyStore::new()))
    }

    fn context() -> ContextMap {
        let mut context = ContextMap::new();
        context.insert("order_ref".to_string(), serde_json::json!("ORD-1"));
        context
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let participant = order();
        let tx = TransactionId::new();

        participant.try_execute(tx, &context()).await.unwrap();
        assert_eq!(participant.order_state(tx), Some(OrderState::Pending));
        assert_eq!(participant.order_ref(tx).as_deref(), Some("ORD-1"));

        participant.confirm_execute(tx).await.unwrap();
        assert_eq!(participant.order_state(tx), Some(OrderState::Placed));
    }

    #[tokio::test]
    async fn test_order_ref_defaults_to_transaction() {
        let participant = order();
        let tx = TransactionId::new();

        participant.try_execute(tx, &ContextMap::new()).await.unwrap();
        assert_eq!(participant.order_ref(tx), Some(tx.to_string()));
    }

    #[tokio::test]
    async fn test_cancel_marks_order_canceled() {
        let participant = order();
        let tx = TransactionId::new();
        participant.try_execute(tx, &context()).await.unwrap();

        participant.cancel_execute(tx).await.unwrap();
        assert_eq!(participant.order_state(tx), Some(OrderState::Canceled));
        assert!(matches!(
            participant.confirm_execute(tx).await,
            Err(ParticipantError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_late_try_after_cancel_is_rejected() {
        let participant = order();
        let tx = TransactionId::new();

        participant.cancel_execute(tx).await.unwrap();
        assert!(participant.try_execute(tx, &context()).await.is_err());
        assert!(participant.order_state(tx).is_none());
    }

    #[tokio::test]
    async fn test_injected_confirm_failure() {
        let participant = order();
        let tx = TransactionId::new();
        participant.try_execute(tx, &context()).await.unwrap();
        participant.faults().fail_transiently(Phase::Confirm, 1);

        assert!(matches!(
            participant.confirm_execute(tx).await,
            Err(ParticipantError::Transient(_))
        ));
        participant.confirm_execute(tx).await.unwrap();
        assert_eq!(participant.order_state(tx), Some(OrderState::Placed));
    }
}
