//! Demo runner: drives a few TCC transactions against the example participants.

use std::sync::Arc;

use tcc::{
    AccountParticipant, CoordinatorConfig, InventoryParticipant, OrderParticipant, Participant,
    Phase, TccError, TransactionCoordinator, TransactionId, TransactionStatus,
};
use thiserror::Error;
use tx_log::{IdempotencyStore, LogError, TransactionLog};

/// Errors that stop the demo.
#[derive(Debug, Error)]
pub enum DemoError {
    #[error("Coordinator error: {0}")]
    Coordinator(#[from] TccError),

    #[error("Transaction log error: {0}")]
    Log(#[from] LogError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

/// Demo configuration.
///
/// Reads from environment variables:
/// - `DATABASE_URL`: PostgreSQL backend for the log and idempotency keys
///   (default: unset, everything stays in memory)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
///
/// Coordinator settings come from [`CoordinatorConfig::from_env`].
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub database_url: Option<String>,
    pub log_level: String,
    pub coordinator: CoordinatorConfig,
}

impl DemoConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            coordinator: CoordinatorConfig::from_env(),
        }
    }
}

/// Example participants sharing one idempotency store.
pub struct DemoParticipants {
    pub account: Arc<AccountParticipant>,
    pub inventory: Arc<InventoryParticipant>,
    pub order: Arc<OrderParticipant>,
}

impl DemoParticipants {
    pub fn new(idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            account: Arc::new(
                AccountParticipant::new(Arc::clone(&idempotency)).with_balance("alice", 500),
            ),
            inventory: Arc::new(
                InventoryParticipant::new(Arc::clone(&idempotency)).with_stock("SKU-RED-MUG", 3),
            ),
            order: Arc::new(OrderParticipant::new(idempotency)),
        }
    }

    /// Participants in the order they are registered.
    fn all(&self) -> [Arc<dyn Participant>; 3] {
        [
            Arc::clone(&self.account) as Arc<dyn Participant>,
            Arc::clone(&self.order) as Arc<dyn Participant>,
            Arc::clone(&self.inventory) as Arc<dyn Participant>,
        ]
    }
}

/// Outcome of one demo transaction.
#[derive(Debug, Clone)]
pub struct DemoRun {
    pub name: &'static str,
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
}

async fn run_purchase<L: TransactionLog + 'static>(
    coordinator: &TransactionCoordinator<L>,
    participants: &DemoParticipants,
    name: &'static str,
    amount: i64,
    quantity: i64,
) -> Result<DemoRun, DemoError> {
    let transaction_id = coordinator.begin().await?;
    coordinator
        .put_context(transaction_id, "account", serde_json::json!("alice"))
        .await?;
    coordinator
        .put_context(transaction_id, "amount", serde_json::json!(amount))
        .await?;
    coordinator
        .put_context(transaction_id, "sku", serde_json::json!("SKU-RED-MUG"))
        .await?;
    coordinator
        .put_context(transaction_id, "quantity", serde_json::json!(quantity))
        .await?;
    coordinator
        .put_context(transaction_id, "order_ref", serde_json::json!(name))
        .await?;
    for participant in participants.all() {
        coordinator
            .register_participant(transaction_id, participant)
            .await?;
    }

    let status = coordinator.commit(transaction_id).await?;
    metrics::counter!("tcc_demo_runs_total", "status" => status.as_str()).increment(1);
    tracing::info!(name, %transaction_id, %status, "demo transaction finished");

    Ok(DemoRun {
        name,
        transaction_id,
        status,
    })
}

/// Runs the demo transactions.
///
/// 1. A purchase that fits both balance and stock, which confirms.
/// 2. A purchase of more mugs than are left, which cancels.
/// 3. A purchase whose account confirm fails twice before succeeding.
pub async fn run_demo<L: TransactionLog + 'static>(
    coordinator: &TransactionCoordinator<L>,
    participants: &DemoParticipants,
) -> Result<Vec<DemoRun>, DemoError> {
    let report = coordinator.recover().await?;
    if !report.resumed.is_empty() || !report.failed.is_empty() {
        tracing::info!(
            resumed = report.resumed.len(),
            failed = report.failed.len(),
            "recovered transactions from a previous run"
        );
    }

    let mut runs = Vec::new();
    runs.push(run_purchase(coordinator, participants, "confirmed-purchase", 120, 2).await?);
    runs.push(run_purchase(coordinator, participants, "out-of-stock-purchase", 60, 5).await?);

    participants
        .account
        .faults()
        .fail_transiently(Phase::Confirm, 2);
    runs.push(run_purchase(coordinator, participants, "flaky-confirm-purchase", 50, 1).await?);

    for stuck in coordinator.list_stuck_transactions().await {
        tracing::warn!(transaction_id = %stuck, "transaction needs an operator");
    }
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tx_log::{InMemoryIdempotencyStore, InMemoryTransactionLog};

    use super::*;

    #[tokio::test]
    async fn test_demo_outcomes() {
        let config = CoordinatorConfig::default().with_backoff(Duration::from_millis(2), 2.0);
        let coordinator = TransactionCoordinator::new(InMemoryTransactionLog::new(), config);
        let participants = DemoParticipants::new(Arc::new(InMemoryIdempotencyStore::new()));

        let runs = run_demo(&coordinator, &participants).await.unwrap();

        let statuses: Vec<TransactionStatus> = runs.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                TransactionStatus::Confirmed,
                TransactionStatus::Canceled,
                TransactionStatus::Confirmed,
            ]
        );
        assert_eq!(participants.account.balance("alice"), Some(330));
        assert_eq!(participants.inventory.stock("SKU-RED-MUG"), Some(0));
    }
}
