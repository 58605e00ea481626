//! Bounded, timed dispatch of participant calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{Phase, TransactionId};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tx_log::ContextMap;

use crate::participant::{Participant, ParticipantError, PhaseResult, execute_phase};

/// Runs participant calls on spawned tasks.
///
/// A semaphore caps how many calls are awaited at once across all
/// transactions, and each call is bounded by a timeout. A call that times out
/// is reported as [`ParticipantError::Timeout`] and gives its permit back, so
/// a hung participant cannot starve other transactions. It keeps running in
/// the background and is counted by [`abandoned_calls`](Self::abandoned_calls)
/// until it returns.
#[derive(Clone)]
pub struct CallDispatcher {
    permits: Arc<Semaphore>,
    abandoned: Arc<AtomicUsize>,
    timeout: Duration,
}

impl CallDispatcher {
    pub fn new(max_in_flight: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            abandoned: Arc::new(AtomicUsize::new(0)),
            timeout,
        }
    }

    /// Calls `phase` on `participant` and waits for the answer.
    pub async fn call(
        &self,
        participant: Arc<dyn Participant>,
        phase: Phase,
        transaction_id: TransactionId,
        context: Arc<ContextMap>,
    ) -> PhaseResult {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ParticipantError::transient("dispatcher closed"))?;

        let mut task = tokio::spawn(async move {
            execute_phase(participant.as_ref(), phase, transaction_id, &context).await
        });

        let result = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(ParticipantError::transient(format!(
                "participant call aborted: {join_error}"
            ))),
            Err(_) => {
                self.abandon(task, phase, transaction_id);
                Err(ParticipantError::Timeout(self.timeout))
            }
        };

        let outcome = match &result {
            Ok(()) => "success",
            Err(ParticipantError::Rejected(_)) => "rejected",
            Err(ParticipantError::Transient(_)) => "transient",
            Err(ParticipantError::Timeout(_)) => "timeout",
        };
        metrics::counter!(
            "tcc_participant_calls_total",
            "phase" => phase.as_str(),
            "outcome" => outcome
        )
        .increment(1);

        result
    }

    /// Number of calls that could start right now.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Timed-out calls whose participant has not returned yet.
    pub fn abandoned_calls(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn abandon(&self, task: JoinHandle<PhaseResult>, phase: Phase, transaction_id: TransactionId) {
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("tcc_abandoned_calls_total", "phase" => phase.as_str()).increment(1);

        let abandoned = Arc::clone(&self.abandoned);
        tokio::spawn(async move {
            let late = task.await;
            abandoned.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(%transaction_id, %phase, ?late, "abandoned participant call returned");
        });
    }
}
