//! Retry scheduling for Confirm and Cancel calls.
//!
//! Failed calls are queued as retry units and drained by a fixed pool of
//! worker tasks. Backoff delays are Tokio timers, so a waiting retry holds
//! no worker and no thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ParticipantId, Phase, TransactionId};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, TccError};
use crate::participant::{ParticipantError, PhaseResult};

/// Retry limits and exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before the `retry`-th retry (1-based): `base * factor^(retry - 1)`,
    /// capped at `max_backoff`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.backoff_base.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Identifier of a retry unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RetryUnitId(u64);

impl fmt::Display for RetryUnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry-{}", self.0)
    }
}

/// Lifecycle of a retry unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryUnitState {
    Queued,
    Running,
    Succeeded,
    /// Failed again and waiting for its next backoff delay.
    Rescheduled,
    Dead,
}

/// Final answer for a retry unit.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryResolution {
    Succeeded { attempts: u32 },
    Dead { attempts: u32, error: ParticipantError },
}

impl RetryResolution {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, RetryResolution::Succeeded { .. })
    }
}

/// A participant call that failed and should be repeated.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    pub transaction_id: TransactionId,
    pub participant_id: ParticipantId,
    pub phase: Phase,
    /// Attempts already made, including the first one.
    pub attempts_made: u32,
    pub last_error: ParticipantError,
}

/// A unit that exhausted its retries or was rejected.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub unit_id: RetryUnitId,
    pub transaction_id: TransactionId,
    pub participant_id: ParticipantId,
    pub phase: Phase,
    pub attempts: u32,
    pub error: ParticipantError,
    pub died_at: DateTime<Utc>,
}

/// The call to repeat. It receives the attempt number it runs as.
pub type RetryOperation = Arc<dyn Fn(u32) -> BoxFuture<'static, PhaseResult> + Send + Sync>;

/// Resolves once the scheduler is done with a unit.
#[derive(Debug)]
pub struct RetryHandle {
    unit_id: RetryUnitId,
    receiver: oneshot::Receiver<RetryResolution>,
}

impl RetryHandle {
    pub fn unit_id(&self) -> RetryUnitId {
        self.unit_id
    }

    /// Waits for the unit to succeed or die.
    pub async fn resolution(self) -> Result<RetryResolution> {
        self.receiver.await.map_err(|_| TccError::SchedulerClosed)
    }
}

struct RetryUnit {
    id: RetryUnitId,
    request: RetryRequest,
    retries_used: u32,
    operation: RetryOperation,
    reply: oneshot::Sender<RetryResolution>,
}

impl RetryUnit {
    fn attempts(&self) -> u32 {
        self.request.attempts_made + self.retries_used
    }
}

struct Shared {
    policy: RetryPolicy,
    states: Mutex<HashMap<RetryUnitId, RetryUnitState>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    next_id: AtomicU64,
}

impl Shared {
    fn states(&self) -> MutexGuard<'_, HashMap<RetryUnitId, RetryUnitState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, id: RetryUnitId, state: RetryUnitState) {
        self.states().insert(id, state);
    }

    fn bury(&self, unit: RetryUnit, error: ParticipantError) {
        let attempts = unit.attempts();
        tracing::warn!(
            unit_id = %unit.id,
            transaction_id = %unit.request.transaction_id,
            participant_id = %unit.request.participant_id,
            phase = %unit.request.phase,
            attempts,
            error = %error,
            "retry unit is dead"
        );
        metrics::counter!("tcc_dead_letters_total").increment(1);

        self.set_state(unit.id, RetryUnitState::Dead);
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetter {
                unit_id: unit.id,
                transaction_id: unit.request.transaction_id,
                participant_id: unit.request.participant_id.clone(),
                phase: unit.request.phase,
                attempts,
                error: error.clone(),
                died_at: Utc::now(),
            });
        let _ = unit.reply.send(RetryResolution::Dead { attempts, error });
    }
}

/// Queue of retry units drained by a pool of worker tasks.
///
/// Dropping the scheduler stops its workers; outstanding handles then
/// resolve to [`TccError::SchedulerClosed`].
pub struct RetryScheduler {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<RetryUnit>,
    workers: Vec<JoinHandle<()>>,
}

impl RetryScheduler {
    /// Starts `workers` worker tasks. Must be called inside a Tokio runtime.
    pub fn new(policy: RetryPolicy, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            policy,
            states: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|_| {
                tokio::spawn(run_worker(
                    Arc::clone(&shared),
                    Arc::clone(&receiver),
                    sender.clone(),
                ))
            })
            .collect();

        Self {
            shared,
            sender,
            workers,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Queues `operation` for retry after the first backoff delay.
    ///
    /// A non-retryable error, or a policy without retries, makes the unit dead
    /// straight away.
    pub fn schedule(&self, request: RetryRequest, operation: RetryOperation) -> Result<RetryHandle> {
        if self.sender.is_closed() {
            return Err(TccError::SchedulerClosed);
        }

        let id = RetryUnitId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (reply, receiver) = oneshot::channel();
        let last_error = request.last_error.clone();
        let unit = RetryUnit {
            id,
            request,
            retries_used: 0,
            operation,
            reply,
        };

        if !last_error.is_retryable() || self.shared.policy.max_retries == 0 {
            self.shared.bury(unit, last_error);
        } else {
            tracing::debug!(
                unit_id = %id,
                transaction_id = %unit.request.transaction_id,
                participant_id = %unit.request.participant_id,
                phase = %unit.request.phase,
                "retry scheduled"
            );
            let delay = self.shared.policy.delay_for(1);
            enqueue_after(&self.shared, self.sender.clone(), unit, delay);
        }

        Ok(RetryHandle {
            unit_id: id,
            receiver,
        })
    }

    /// Current state of a unit, if it exists.
    pub fn unit_state(&self, unit_id: RetryUnitId) -> Option<RetryUnitState> {
        self.shared.states().get(&unit_id).copied()
    }

    /// Units that died, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn enqueue_after(
    shared: &Shared,
    sender: mpsc::UnboundedSender<RetryUnit>,
    unit: RetryUnit,
    delay: Duration,
) {
    shared.set_state(unit.id, RetryUnitState::Queued);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // A failed send drops the unit, which closes its handle
        let _ = sender.send(unit);
    });
}

async fn run_worker(
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RetryUnit>>>,
    sender: mpsc::UnboundedSender<RetryUnit>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(mut unit) = next else { break };

        shared.set_state(unit.id, RetryUnitState::Running);
        unit.retries_used += 1;
        let attempt = unit.attempts();
        metrics::counter!("tcc_retry_attempts_total").increment(1);

        match (unit.operation)(attempt).await {
            Ok(()) => {
                tracing::info!(
                    unit_id = %unit.id,
                    transaction_id = %unit.request.transaction_id,
                    participant_id = %unit.request.participant_id,
                    phase = %unit.request.phase,
                    attempt,
                    "retry succeeded"
                );
                shared.set_state(unit.id, RetryUnitState::Succeeded);
                let _ = unit
                    .reply
                    .send(RetryResolution::Succeeded { attempts: attempt });
            }
            Err(error) if error.is_retryable() && unit.retries_used < shared.policy.max_retries => {
                let delay = shared.policy.delay_for(unit.retries_used + 1);
                tracing::info!(
                    unit_id = %unit.id,
                    transaction_id = %unit.request.transaction_id,
                    participant_id = %unit.request.participant_id,
                    phase = %unit.request.phase,
                    attempt,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "retry failed, rescheduling"
                );
                shared.set_state(unit.id, RetryUnitState::Rescheduled);
                unit.request.last_error = error;
                enqueue_after(&shared, sender.clone(), unit, delay);
            }
            Err(error) => shared.bury(unit, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures_util::FutureExt;

    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff_base: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_millis(20),
        }
    }

    fn request(error: ParticipantError) -> RetryRequest {
        RetryRequest {
            transaction_id: TransactionId::new(),
            participant_id: ParticipantId::from("account"),
            phase: Phase::Confirm,
            attempts_made: 1,
            last_error: error,
        }
    }

    /// Operation failing transiently `failures` times, recording attempt numbers.
    fn flaky(failures: u32, seen: Arc<Mutex<Vec<u32>>>) -> RetryOperation {
        let calls = Arc::new(AtomicU32::new(0));
        Arc::new(move |attempt: u32| {
            let calls = Arc::clone(&calls);
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(attempt);
                if calls.fetch_add(1, Ordering::SeqCst) < failures {
                    Err(ParticipantError::transient("unavailable"))
                } else {
                    Ok(())
                }
            }
            .boxed()
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(4), Duration::from_secs(3));
        assert_eq!(policy.delay_for(100), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unit_succeeds_after_transient_failures() {
        let scheduler = RetryScheduler::new(policy(5), 2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = scheduler
            .schedule(
                request(ParticipantError::transient("503")),
                flaky(1, Arc::clone(&seen)),
            )
            .unwrap();
        let unit_id = handle.unit_id();

        assert_eq!(
            handle.resolution().await.unwrap(),
            RetryResolution::Succeeded { attempts: 3 }
        );
        assert_eq!(*seen.lock().unwrap(), vec![2, 3]);
        assert_eq!(scheduler.unit_state(unit_id), Some(RetryUnitState::Succeeded));
        assert!(scheduler.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_unit_dies_after_max_retries() {
        let scheduler = RetryScheduler::new(policy(3), 2);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = scheduler
            .schedule(
                request(ParticipantError::transient("503")),
                flaky(u32::MAX, Arc::clone(&seen)),
            )
            .unwrap();
        let unit_id = handle.unit_id();

        let resolution = handle.resolution().await.unwrap();
        assert!(matches!(resolution, RetryResolution::Dead { attempts: 4, .. }));
        assert_eq!(seen.lock().unwrap().len(), 3);
        assert_eq!(scheduler.unit_state(unit_id), Some(RetryUnitState::Dead));

        let dead = scheduler.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].unit_id, unit_id);
        assert_eq!(dead[0].attempts, 4);
    }

    #[tokio::test]
    async fn test_rejection_is_never_retried() {
        let scheduler = RetryScheduler::new(policy(5), 1);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = scheduler
            .schedule(
                request(ParticipantError::rejected("expired")),
                flaky(0, Arc::clone(&seen)),
            )
            .unwrap();

        let resolution = handle.resolution().await.unwrap();
        assert!(matches!(resolution, RetryResolution::Dead { attempts: 1, .. }));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_during_retry_kills_unit() {
        let scheduler = RetryScheduler::new(policy(5), 1);
        let operation: RetryOperation =
            Arc::new(|_: u32| async { Err(ParticipantError::rejected("gone")) }.boxed());

        let handle = scheduler
            .schedule(request(ParticipantError::transient("503")), operation)
            .unwrap();

        assert_eq!(
            handle.resolution().await.unwrap(),
            RetryResolution::Dead {
                attempts: 2,
                error: ParticipantError::rejected("gone"),
            }
        );
    }

    #[tokio::test]
    async fn test_zero_retries_dies_immediately() {
        let scheduler = RetryScheduler::new(policy(0), 1);
        let handle = scheduler
            .schedule(
                request(ParticipantError::transient("503")),
                flaky(0, Arc::new(Mutex::new(Vec::new()))),
            )
            .unwrap();

        assert!(!handle.resolution().await.unwrap().is_succeeded());
        assert_eq!(scheduler.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_many_units_share_the_pool() {
        let scheduler = RetryScheduler::new(policy(5), 2);
        let handles: Vec<RetryHandle> = (0..10)
            .map(|_| {
                scheduler
                    .schedule(
                        request(ParticipantError::transient("503")),
                        flaky(2, Arc::new(Mutex::new(Vec::new()))),
                    )
                    .unwrap()
            })
            .collect();

        for handle in handles {
            assert!(handle.resolution().await.unwrap().is_succeeded());
        }
    }
}
