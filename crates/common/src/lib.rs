//! Shared types for the TCC transaction coordinator.

pub mod status;
pub mod types;

pub use status::{Phase, PhaseOutcome, TransactionStatus};
pub use types::{ParticipantId, TransactionId};
