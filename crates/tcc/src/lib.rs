//! Try-Confirm-Cancel transaction coordinator.
//!
//! A transaction is started with [`TransactionCoordinator::begin`], gets its
//! participants registered, and is then committed:
//!
//! 1. Try is called on every participant in registration order; the first
//!    failure stops the phase.
//! 2. If every Try succeeded, Confirm is called on every participant.
//! 3. Otherwise Cancel is called, in reverse order, on the participants
//!    whose Try succeeded.
//!
//! Confirm and Cancel failures are retried with exponential backoff. A
//! participant that never succeeds leaves the transaction `Stuck` for an
//! operator. Every step is written to a [`tx_log::TransactionLog`] first, so
//! [`TransactionCoordinator::recover`] can finish in-flight transactions
//! after a crash.

pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod participant;
pub mod participants;
pub mod recovery;
pub mod registry;
pub mod retry;

pub use common::{ParticipantId, Phase, PhaseOutcome, TransactionId, TransactionStatus};
pub use config::{ConfirmParallelism, CoordinatorConfig, DEFAULT_LEASE_EXPIRY};
pub use context::{ParticipantRecord, StatusReport, TransactionContext};
pub use coordinator::TransactionCoordinator;
pub use dispatch::CallDispatcher;
pub use error::{Result, TccError};
pub use participant::{Participant, ParticipantError, PhaseResult};
pub use participants::{
    AccountParticipant, FaultInjector, InventoryParticipant, OrderParticipant, OrderState,
};
pub use recovery::RecoveryReport;
pub use registry::TransactionRegistry;
pub use retry::{
    DeadLetter, RetryHandle, RetryOperation, RetryPolicy, RetryRequest, RetryResolution,
    RetryScheduler, RetryUnitId, RetryUnitState,
};
