use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EntryId, IdempotencyKey, IdempotencyStore, LogEntry, LogError, LogQuery, LogRecord, Result,
    Sequence, TransactionId,
    store::{AppendOptions, EntryStream, TransactionLog, validate_records},
};

const SELECT_COLUMNS: &str = "id, transaction_id, sequence, timestamp, payload";

/// PostgreSQL-backed transaction log.
///
/// Per-transaction sequences are allocated through the `transaction_log_heads`
/// row, which serializes concurrent appends to the same transaction.
#[derive(Clone)]
pub struct PostgresTransactionLog {
    pool: PgPool,
}

impl PostgresTransactionLog {
    /// Creates a new PostgreSQL transaction log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_entry(row: PgRow) -> Result<LogEntry> {
        let payload: serde_json::Value = row.try_get("payload")?;

        Ok(LogEntry {
            entry_id: EntryId::from_uuid(row.try_get::<Uuid, _>("id")?),
            transaction_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("transaction_id")?),
            sequence: Sequence::new(row.try_get("sequence")?),
            timestamp: row.try_get("timestamp")?,
            record: serde_json::from_value(payload)?,
        })
    }
}

#[async_trait]
impl TransactionLog for PostgresTransactionLog {
    async fn append(
        &self,
        transaction_id: TransactionId,
        records: Vec<LogRecord>,
        options: AppendOptions,
    ) -> Result<Sequence> {
        validate_records(&records)?;

        let count = records.len() as i64;
        let mut tx = self.pool.begin().await?;

        // Reserve `count` sequences; the row lock is held until commit.
        let last: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO transaction_log_heads (transaction_id, last_sequence)
            VALUES ($1, $2)
            ON CONFLICT (transaction_id) DO UPDATE
                SET last_sequence = transaction_log_heads.last_sequence + EXCLUDED.last_sequence
            RETURNING last_sequence
            "#,
        )
        .bind(transaction_id.as_uuid())
        .bind(count)
        .fetch_one(&mut *tx)
        .await?;

        let current = Sequence::new(last - count);
        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(LogError::SequenceConflict {
                transaction_id,
                expected,
                actual: current,
            });
        }

        let mut sequence = current;
        for record in &records {
            sequence = sequence.next();
            let entry = LogEntry::new(transaction_id, sequence, record.clone());
            let attempt = entry.phase_attempt();

            sqlx::query(
                r#"
                INSERT INTO transaction_log
                    (id, transaction_id, sequence, record_type, phase, participant_id, outcome, attempt, timestamp, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(entry.entry_id.as_uuid())
            .bind(transaction_id.as_uuid())
            .bind(sequence.as_i64())
            .bind(record.record_type())
            .bind(attempt.map(|a| a.phase.as_str()))
            .bind(attempt.map(|a| a.participant_id.as_str().to_string()))
            .bind(attempt.map(|a| a.outcome.as_str()))
            .bind(attempt.map(|a| a.attempt as i32))
            .bind(entry.timestamp)
            .bind(serde_json::to_value(record)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_transaction_sequence")
                {
                    return LogError::SequenceConflict {
                        transaction_id,
                        expected: options.expected_sequence.unwrap_or(current),
                        actual: sequence,
                    };
                }
                LogError::Database(e)
            })?;
        }

        tx.commit().await?;
        metrics::counter!("tx_log_appends_total").increment(records.len() as u64);
        Ok(sequence)
    }

    async fn read_all(&self, transaction_id: TransactionId) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM transaction_log WHERE transaction_id = $1 ORDER BY sequence ASC"
        ))
        .bind(transaction_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn read_from(
        &self,
        transaction_id: TransactionId,
        from: Sequence,
    ) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM transaction_log WHERE transaction_id = $1 AND sequence >= $2 ORDER BY sequence ASC"
        ))
        .bind(transaction_id.as_uuid())
        .bind(from.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn list_transactions(&self) -> Result<Vec<TransactionId>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT transaction_id
            FROM transaction_log
            GROUP BY transaction_id
            ORDER BY MIN(timestamp) ASC, transaction_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(TransactionId::from_uuid).collect())
    }

    async fn query(&self, query: LogQuery) -> Result<Vec<LogEntry>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM transaction_log WHERE 1=1");
        let mut param_count = 0;

        if query.transaction_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND transaction_id = ${param_count}"));
        }
        if query.record_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND record_type = ANY(${param_count})"));
        }
        if query.phase.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND phase = ${param_count}"));
        }
        if query.participant_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND participant_id = ${param_count}"));
        }
        if query.outcome.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND outcome = ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp <= ${param_count}"));
        }

        sql.push_str(" ORDER BY timestamp ASC, sequence ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.transaction_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(record_types) = query.record_types {
            sqlx_query = sqlx_query.bind(record_types);
        }
        if let Some(phase) = query.phase {
            sqlx_query = sqlx_query.bind(phase.as_str());
        }
        if let Some(participant_id) = query.participant_id {
            sqlx_query = sqlx_query.bind(participant_id.as_str().to_string());
        }
        if let Some(outcome) = query.outcome {
            sqlx_query = sqlx_query.bind(outcome.as_str());
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_entry).collect()
    }

    async fn stream_all(&self) -> Result<EntryStream> {
        use futures_util::StreamExt;

        let stream = sqlx::query(
            r#"
            SELECT id, transaction_id, sequence, timestamp, payload
            FROM transaction_log
            ORDER BY timestamp ASC, sequence ASC
            "#,
        )
        .fetch(&self.pool)
        .map(|result| match result {
            Ok(row) => Self::row_to_entry(row),
            Err(e) => Err(LogError::Database(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn last_sequence(&self, transaction_id: TransactionId) -> Result<Option<Sequence>> {
        let last: Option<i64> = sqlx::query_scalar(
            "SELECT last_sequence FROM transaction_log_heads WHERE transaction_id = $1",
        )
        .bind(transaction_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(last.map(Sequence::new))
    }
}

/// PostgreSQL-backed idempotency store.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn check(&self, key: &IdempotencyKey) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM idempotency_keys
                WHERE transaction_id = $1 AND participant_id = $2 AND phase = $3
            )
            "#,
        )
        .bind(key.transaction_id.as_uuid())
        .bind(key.participant_id.as_str())
        .bind(key.phase.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark(&self, key: &IdempotencyKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (transaction_id, participant_id, phase)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(key.transaction_id.as_uuid())
        .bind(key.participant_id.as_str())
        .bind(key.phase.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
