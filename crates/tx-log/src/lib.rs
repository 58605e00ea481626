//! Durable, append-only phase log and idempotency records for TCC transactions.
//!
//! The coordinator only exchanges plain data records with this crate, so any
//! backend that implements [`TransactionLog`] and [`IdempotencyStore`] can be
//! plugged in. In-memory and PostgreSQL backends are provided.

pub mod entry;
pub mod error;
pub mod idempotency;
pub mod lease;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::{ParticipantId, Phase, PhaseOutcome, TransactionId, TransactionStatus};
pub use entry::{ContextMap, EntryId, LogEntry, LogRecord, PhaseAttempt, Sequence};
pub use error::{LogError, Result};
pub use idempotency::{IdempotencyKey, IdempotencyStore, InMemoryIdempotencyStore};
pub use lease::{ExecutionLease, acquire_lease, current_lease, release_lease};
pub use memory::InMemoryTransactionLog;
pub use postgres::{PostgresIdempotencyStore, PostgresTransactionLog};
pub use query::LogQuery;
pub use store::{AppendOptions, EntryStream, TransactionLog, TransactionLogExt};
