//! Inventory participant: reserves stock in Try, deducts it in Confirm.

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
struct Reservation {
    sku: String,
    quantity: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Warehouse {
    stock: HashMap<String, i64>,
    reservations: HashMap<TransactionId, Reservation>,
}

impl Warehouse {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.reservations.retain(|_, r| r.expires_at > now);
    }

    fn reserved(&self, sku: &str) -> i64 {
        self.reservations
            .values()
            .filter(|r| r.sku == sku)
            .map(|r| r.quantity)
            .sum()
    }
}

/// Holds stock levels per SKU.
///
/// Reads `sku` and `quantity` from the transaction context.
pub struct InventoryParticipant {
    id: ParticipantId,
    idempotency: Arc<dyn IdempotencyStore>,
    reservation_lease: Duration,
    faults: FaultInjector,
    warehouse: Mutex<Warehouse>,
}

impl InventoryParticipant {
    pub fn new(idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            id: ParticipantId::from("inventory"),
            idempotency,
            reservation_lease: DEFAULT_LEASE_EXPIRY,
            faults: FaultInjector::new(),
            warehouse: Mutex::new(Warehouse::default()),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.reservation_lease = lease;
        self
    }

    pub fn with_stock(self, sku: impl Into<String>, quantity: i64) -> Self {
        self.warehouse().stock.insert(sku.into(), quantity);
        self
    }

    fn warehouse(&self) -> MutexGuard<'_, Warehouse> {
        self.warehouse.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Units on hand, reserved or not.
    pub fn stock(&self, sku: &str) -> Option<i64> {
        self.warehouse().stock.get(sku).copied()
    }

    /// Units on hand minus live reservations.
    pub fn available(&self, sku: &str) -> Option<i64> {
        let mut warehouse = self.warehouse();
        warehouse.purge_expired(Utc::now());
        let stock = warehouse.stock.get(sku).copied()?;
        Some(stock - warehouse.reserved(sku))
    }

    pub fn reservation_count(&self) -> usize {
        self.warehouse().reservations.len()
    }
}

#[async_trait]
impl Participant for InventoryParticipant {
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

        let sku = context_str(context, "sku")?;
        let quantity = context_quantity(context, "quantity")?;
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.reservation_lease)
                .map_err(|e| ParticipantError::rejected(format!("invalid lease: {e}")))?;

        {
            let mut warehouse = self.warehouse();
            warehouse.purge_expired(now);
            let on_hand = warehouse.stock.get(sku).copied().unwrap_or(0);
            let available = on_hand - warehouse.reserved(sku);
            if available < quantity {
                return Err(ParticipantError::rejected(format!(
                    "insufficient stock for {sku}: {available} available, {quantity} requested"
                )));
            }
            warehouse.reservations.insert(
                transaction_id,
                Reservation {
                    sku: sku.to_string(),
                    quantity,
                    expires_at,
                },
            );
        }

        tracing::debug!(%transaction_id, sku, quantity, "stock reserved");
        ledger.mark_done(Phase::Try).await
    }

    async fn confirm_execute(&self, transaction_id: TransactionId) -> PhaseResult {
        self.faults.enter(Phase::Confirm).await?;
        let ledger = PhaseLedger::new(self.idempotency.as_ref(), transaction_id, &self.id);
        if ledger.is_done(Phase::Confirm).await? {
            return Ok(());
        }

        {
            let mut warehouse = self.warehouse();
            let reservation = warehouse
                .reservations
                .remove(&transaction_id)
                .filter(|r| r.expires_at > Utc::now())
                .ok_or_else(|| {
                    ParticipantError::rejected(format!(
                        "no live reservation for transaction {transaction_id}"
                    ))
                })?;
            if let Some(stock) = warehouse.stock.get_mut(&reservation.sku) {
                *stock -= reservation.quantity;
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

        if self.warehouse().reservations.remove(&transaction_id).is_none() {
            tracing::debug!(%transaction_id, "cancel without reservation, nothing to release");
        }
        ledger.mark_done(Phase::Cancel).await
    }
}
