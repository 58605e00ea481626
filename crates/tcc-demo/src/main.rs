//! Demo entry point.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tcc::TransactionCoordinator;
use tcc_demo::{DemoConfig, DemoError, DemoParticipants, DemoRun, run_demo};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tx_log::{
    InMemoryIdempotencyStore, InMemoryTransactionLog, PostgresIdempotencyStore,
    PostgresTransactionLog,
};

#[tokio::main]
async fn main() -> Result<(), DemoError> {
    let config = DemoConfig::from_env();

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| DemoError::Metrics(e.to_string()))?;

    tracing::info!(
        instance_id = %config.coordinator.instance_id,
        backend = if config.database_url.is_some() { "postgres" } else { "memory" },
        "starting TCC demo"
    );

    // 3. Run the demo on the configured backend
    let runs = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
            let log = PostgresTransactionLog::new(pool.clone());
            log.run_migrations().await?;

            let participants =
                DemoParticipants::new(Arc::new(PostgresIdempotencyStore::new(pool)));
            let coordinator = TransactionCoordinator::new(log, config.coordinator.clone());
            run_demo(&coordinator, &participants).await?
        }
        None => {
            let participants = DemoParticipants::new(Arc::new(InMemoryIdempotencyStore::new()));
            let coordinator =
                TransactionCoordinator::new(InMemoryTransactionLog::new(), config.coordinator.clone());
            run_demo(&coordinator, &participants).await?
        }
    };

    // 4. Report
    for DemoRun {
        name,
        transaction_id,
        status,
    } in &runs
    {
        println!("{name:<24} {transaction_id} {status}");
    }
    println!();
    println!("{}", metrics_handle.render());

    Ok(())
}
