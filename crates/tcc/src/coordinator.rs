//! Transaction coordinator driving the Try, Confirm and Cancel phases.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use common::{ParticipantId, Phase, PhaseOutcome, TransactionId, TransactionStatus};
use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::RwLock;
use tx_log::{
    AppendOptions, ContextMap, LogEntry, LogQuery, LogRecord, Sequence, TransactionLog,
    acquire_lease, release_lease,
};

use crate::config::{ConfirmParallelism, CoordinatorConfig};
use crate::context::{StatusReport, TransactionContext};
use crate::dispatch::CallDispatcher;
use crate::error::{Result, TccError};
use crate::participant::{Participant, ParticipantError, PhaseResult};
use crate::registry::TransactionRegistry;
use crate::retry::{DeadLetter, RetryHandle, RetryOperation, RetryRequest, RetryScheduler};

/// Coordinates TCC transactions across registered participants.
///
/// Every state change is appended to the transaction log before it is
/// applied to the in-memory registry, so a coordinator built over the same
/// log can pick up where a crashed one stopped (see
/// [`recover`](Self::recover)).
///
/// Cloning is cheap; clones share the same registry and retry scheduler.
pub struct TransactionCoordinator<L: TransactionLog + 'static> {
    pub(crate) inner: Arc<Inner<L>>,
}

impl<L: TransactionLog + 'static> Clone for TransactionCoordinator<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct Inner<L> {
    pub(crate) log: L,
    pub(crate) config: CoordinatorConfig,
    pub(crate) registry: TransactionRegistry,
    directory: RwLock<HashMap<ParticipantId, Arc<dyn Participant>>>,
    dispatcher: CallDispatcher,
    scheduler: RetryScheduler,
    /// Transactions this instance is driving right now.
    active: Mutex<HashSet<TransactionId>>,
}

/// Marks a transaction as driven by this instance until dropped.
pub(crate) struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<TransactionId>>,
    transaction_id: TransactionId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.transaction_id);
    }
}

/// First attempt of a Confirm or Cancel call, possibly handed to the scheduler.
enum Completion {
    Done,
    Retrying(RetryHandle),
}

impl<L: TransactionLog + 'static> TransactionCoordinator<L> {
    /// Creates a coordinator over `log`. Must be called inside a Tokio runtime.
    pub fn new(log: L, config: CoordinatorConfig) -> Self {
        let dispatcher = CallDispatcher::new(config.max_in_flight_calls, config.call_timeout);
        let scheduler = RetryScheduler::new(config.retry_policy(), config.retry_workers);
        Self {
            inner: Arc::new(Inner {
                log,
                config,
                registry: TransactionRegistry::new(),
                directory: RwLock::new(HashMap::new()),
                dispatcher,
                scheduler,
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn log(&self) -> &L {
        &self.inner.log
    }

    /// Starts a new transaction in `Trying`.
    pub async fn begin(&self) -> Result<TransactionId> {
        let transaction_id = TransactionId::new();
        let created_at = Utc::now();
        let record = LogRecord::TransactionBegan { created_at };

        let sequence = self
            .inner
            .log
            .append(transaction_id, vec![record.clone()], AppendOptions::expect_new())
            .await?;

        let mut context = TransactionContext::new(transaction_id, created_at);
        context.apply(&LogEntry::new(transaction_id, sequence, record));
        self.inner.registry.insert(context).await;

        tracing::info!(%transaction_id, "transaction started");
        Ok(transaction_id)
    }

    /// Makes a participant resolvable by ID, without registering it on any transaction.
    ///
    /// Recovery needs every participant named in the log to be enlisted first.
    pub async fn enlist(&self, participant: Arc<dyn Participant>) {
        self.inner
            .directory
            .write()
            .await
            .insert(participant.participant_id(), participant);
    }

    /// Adds a participant to a transaction that has not started committing.
    pub async fn register_participant(
        &self,
        transaction_id: TransactionId,
        participant: Arc<dyn Participant>,
    ) -> Result<()> {
        let participant_id = participant.participant_id();
        let handle = self
            .inner
            .registry
            .get(transaction_id)
            .await
            .ok_or(TccError::TransactionNotFound(transaction_id))?;

        let mut context = handle.lock().await;
        if context.is_sealed() || context.status() != TransactionStatus::Trying {
            return Err(TccError::Validation(format!(
                "cannot register {participant_id}: transaction {transaction_id} is {} and commit has started",
                context.status()
            )));
        }
        if context.has_participant(&participant_id) {
            return Err(TccError::Validation(format!(
                "participant {participant_id} is already registered on transaction {transaction_id}"
            )));
        }

        let position = context.participants().len() as u32;
        self.inner
            .append(
                &mut context,
                vec![LogRecord::ParticipantRegistered {
                    participant_id: participant_id.clone(),
                    position,
                }],
            )
            .await?;
        drop(context);

        self.enlist(participant).await;
        tracing::debug!(%transaction_id, %participant_id, position, "participant registered");
        Ok(())
    }

    /// Sets an entry of the context map handed to every Try call.
    pub async fn put_context(
        &self,
        transaction_id: TransactionId,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<()> {
        let handle = self
            .inner
            .registry
            .get(transaction_id)
            .await
            .ok_or(TccError::TransactionNotFound(transaction_id))?;

        let mut context = handle.lock().await;
        if context.is_sealed() {
            return Err(TccError::Validation(format!(
                "context of transaction {transaction_id} is frozen once commit starts"
            )));
        }
        context.insert_context(key.into(), value);
        Ok(())
    }

    /// Runs the transaction to a terminal status.
    ///
    /// Returns `Confirmed` if every participant confirmed, `Canceled` if a Try
    /// failed and every reservation was released, and `Stuck` if a Confirm or
    /// Cancel exhausted its retries.
    #[tracing::instrument(skip(self), fields(instance_id = %self.inner.config.instance_id))]
    pub async fn commit(&self, transaction_id: TransactionId) -> Result<TransactionStatus> {
        metrics::counter!("tcc_transactions_total").increment(1);
        let started = Instant::now();
        let _active = self.inner.activate(transaction_id)?;

        let handle = self
            .inner
            .registry
            .get(transaction_id)
            .await
            .ok_or(TccError::TransactionNotFound(transaction_id))?;

        {
            let mut context = handle.lock().await;
            ensure_uncommitted(&context)?;

            let sealed = match self.inner.claim(&mut context).await {
                Ok(()) => self.inner.seal(&mut context).await,
                Err(error) => Err(error),
            };
            drop(context);
            if let Err(error) = sealed {
                self.inner.release(transaction_id).await;
                return Err(error);
            }
        }

        let status = self.inner.drive_leased(transaction_id).await?;

        metrics::histogram!("tcc_commit_duration_seconds").record(started.elapsed().as_secs_f64());
        record_outcome(status);
        Ok(status)
    }

    /// Reports the status and participant records of a transaction.
    ///
    /// Transactions unknown to this instance are rebuilt from the log.
    pub async fn query_status(&self, transaction_id: TransactionId) -> Result<StatusReport> {
        if let Some(context) = self.inner.registry.snapshot(transaction_id).await {
            return Ok(context.report());
        }

        let entries = self.inner.log.read_all(transaction_id).await?;
        TransactionContext::from_entries(&entries)
            .map(|context| context.report())
            .ok_or(TccError::TransactionNotFound(transaction_id))
    }

    /// Transactions waiting for an operator, oldest first.
    pub async fn list_stuck_transactions(&self) -> Vec<TransactionId> {
        let mut stuck: Vec<TransactionContext> = self
            .inner
            .registry
            .snapshots()
            .await
            .into_iter()
            .filter(|c| c.status() == TransactionStatus::Stuck)
            .collect();
        stuck.sort_by_key(|c| c.created_at());
        stuck.into_iter().map(|c| c.transaction_id()).collect()
    }

    /// Re-drives a `Stuck` transaction through the phase it got stuck in.
    ///
    /// Participants that already succeeded in that phase are not called again.
    #[tracing::instrument(skip(self), fields(instance_id = %self.inner.config.instance_id))]
    pub async fn retry_stuck(&self, transaction_id: TransactionId) -> Result<TransactionStatus> {
        let _active = self.inner.activate(transaction_id)?;
        let snapshot = self
            .inner
            .registry
            .snapshot(transaction_id)
            .await
            .ok_or(TccError::TransactionNotFound(transaction_id))?;

        stuck_phase(&snapshot)?;

        let restarted: Result<TransactionStatus> = async {
            // Another instance may have re-driven it since the snapshot was taken
            let current = self.inner.claim_for(transaction_id).await?;
            let resume_in = stuck_phase(&current)?;
            self.inner.transition(transaction_id, resume_in).await?;
            Ok(resume_in)
        }
        .await;
        match restarted {
            Ok(resume_in) => tracing::info!(phase = %resume_in, "re-driving stuck transaction"),
            Err(error) => {
                self.inner.release(transaction_id).await;
                return Err(error);
            }
        }

        let status = self.inner.drive_leased(transaction_id).await?;
        record_outcome(status);
        Ok(status)
    }

    /// Log entries matching `query`, for auditing.
    pub async fn audit_trail(&self, query: LogQuery) -> Result<Vec<LogEntry>> {
        Ok(self.inner.log.query(query).await?)
    }

    /// Retry units that gave up, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.scheduler.dead_letters()
    }
}

fn ensure_uncommitted(context: &TransactionContext) -> Result<()> {
    if context.is_sealed() || context.status() != TransactionStatus::Trying {
        return Err(TccError::Validation(format!(
            "transaction {} is {} and has already been committed",
            context.transaction_id(),
            context.status()
        )));
    }
    Ok(())
}

/// The phase a `Stuck` transaction gave up in.
fn stuck_phase(context: &TransactionContext) -> Result<TransactionStatus> {
    match (context.status(), context.stuck_from()) {
        (TransactionStatus::Stuck, Some(from)) => Ok(from),
        (status, _) => Err(TccError::Validation(format!(
            "transaction {} is {status}, only STUCK transactions can be retried",
            context.transaction_id()
        ))),
    }
}

fn record_outcome(status: TransactionStatus) {
    match status {
        TransactionStatus::Confirmed => metrics::counter!("tcc_transactions_confirmed").increment(1),
        TransactionStatus::Canceled => metrics::counter!("tcc_transactions_canceled").increment(1),
        TransactionStatus::Stuck => metrics::counter!("tcc_transactions_stuck").increment(1),
        _ => {}
    }
}

impl<L: TransactionLog + 'static> Inner<L> {
    pub(crate) fn activate(&self, transaction_id: TransactionId) -> Result<ActiveGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(transaction_id) {
            return Err(TccError::AlreadyActive(transaction_id));
        }
        Ok(ActiveGuard {
            active: &self.active,
            transaction_id,
        })
    }

    pub(crate) fn is_active(&self, transaction_id: TransactionId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&transaction_id)
    }

    /// Appends records to the log, then applies them to `context`.
    ///
    /// The append expects the log to end where `context` does, so a context
    /// that missed another instance's writes fails with a sequence conflict.
    async fn append(&self, context: &mut TransactionContext, records: Vec<LogRecord>) -> Result<()> {
        let transaction_id = context.transaction_id();
        let count = records.len() as i64;
        let last = self
            .log
            .append(
                transaction_id,
                records.clone(),
                AppendOptions::expect_sequence(context.last_sequence()),
            )
            .await?;

        let first = last.as_i64() - count + 1;
        for (offset, record) in records.into_iter().enumerate() {
            let sequence = Sequence::new(first + offset as i64);
            context.apply(&LogEntry::new(transaction_id, sequence, record));
        }
        Ok(())
    }

    async fn append_for(&self, transaction_id: TransactionId, record: LogRecord) -> Result<()> {
        let handle = self
            .registry
            .get(transaction_id)
            .await
            .ok_or(TccError::TransactionNotFound(transaction_id))?;
        let mut context = handle.lock().await;
        self.append(&mut context, vec![record]).await
    }

    /// Takes (or renews) this instance's execution lease and reloads
    /// `context` from the log.
    ///
    /// Whatever other instances wrote before the lease was granted becomes
    /// visible. The context map of a transaction that has not started
    /// committing only exists in memory and is carried over.
    async fn claim(&self, context: &mut TransactionContext) -> Result<()> {
        let transaction_id = context.transaction_id();
        acquire_lease(
            &self.log,
            transaction_id,
            &self.config.instance_id,
            self.config.lease_expiry,
        )
        .await?;

        let entries = self.log.read_all(transaction_id).await?;
        let mut current = TransactionContext::from_entries(&entries)
            .ok_or(TccError::TransactionNotFound(transaction_id))?;
        if !current.is_sealed() {
            for (key, value) in context.context() {
                current.insert_context(key.clone(), value.clone());
            }
        }
        *context = current;
        Ok(())
    }

    /// [`claim`](Self::claim)s a registered transaction and returns the reloaded context.
    pub(crate) async fn claim_for(&self, transaction_id: TransactionId) -> Result<TransactionContext> {
        let handle = self
            .registry
            .get(transaction_id)
            .await
            .ok_or(TccError::TransactionNotFound(transaction_id))?;
        let mut context = handle.lock().await;
        self.claim(&mut context).await?;
        Ok(context.clone())
    }

    /// Freezes the context map and logs the start of the commit.
    async fn seal(&self, context: &mut TransactionContext) -> Result<()> {
        ensure_uncommitted(context)?;
        let frozen = context.context().clone();
        self.append(context, vec![LogRecord::CommitStarted { context: frozen }])
            .await?;
        tracing::info!(
            transaction_id = %context.transaction_id(),
            participants = context.participants().len(),
            "commit started"
        );
        Ok(())
    }

    /// Releases this instance's lease, if it holds one. Failures are only logged.
    pub(crate) async fn release(&self, transaction_id: TransactionId) {
        let released =
            match release_lease(&self.log, transaction_id, &self.config.instance_id).await {
                Ok(released) => released,
                Err(error) => {
                    tracing::warn!(%transaction_id, %error, "failed to release execution lease");
                    return;
                }
            };
        let (Some(sequence), Some(handle)) = (released, self.registry.get(transaction_id).await)
        else {
            return;
        };

        let mut context = handle.lock().await;
        if sequence > context.last_sequence() {
            context.apply(&LogEntry::new(
                transaction_id,
                sequence,
                LogRecord::LeaseReleased {
                    owner: self.config.instance_id.clone(),
                },
            ));
        }
    }

    /// Logs a status change after checking it is allowed.
    pub(crate) async fn transition(
        &self,
        transaction_id: TransactionId,
        to: TransactionStatus,
    ) -> Result<()> {
        let handle = self
            .registry
            .get(transaction_id)
            .await
            .ok_or(TccError::TransactionNotFound(transaction_id))?;
        let mut context = handle.lock().await;

        let from = context.status();
        if !from.can_transition_to(to) {
            return Err(TccError::InvalidTransition {
                transaction_id,
                from,
                to,
            });
        }
        self.append(&mut context, vec![LogRecord::status_changed(from, to)])
            .await?;

        if to.is_terminal() {
            tracing::info!(%transaction_id, %from, %to, "transaction finished");
        } else {
            tracing::debug!(%transaction_id, %from, %to, "status changed");
        }
        Ok(())
    }

    /// Drives the transaction to a terminal status, then releases the lease.
    pub(crate) async fn drive_leased(
        self: &Arc<Self>,
        transaction_id: TransactionId,
    ) -> Result<TransactionStatus> {
        let status = self.drive(transaction_id).await;
        self.release(transaction_id).await;
        status
    }

    async fn drive(self: &Arc<Self>, transaction_id: TransactionId) -> Result<TransactionStatus> {
        loop {
            let snapshot = self
                .registry
                .snapshot(transaction_id)
                .await
                .ok_or(TccError::TransactionNotFound(transaction_id))?;

            match snapshot.status() {
                TransactionStatus::Trying => {
                    let next = self.run_try(&snapshot).await?;
                    self.transition(transaction_id, next).await?;
                }
                TransactionStatus::Confirming => {
                    let next = if self.complete_phase(&snapshot, Phase::Confirm).await? {
                        TransactionStatus::Confirmed
                    } else {
                        TransactionStatus::Stuck
                    };
                    self.transition(transaction_id, next).await?;
                }
                TransactionStatus::Canceling => {
                    let next = if self.complete_phase(&snapshot, Phase::Cancel).await? {
                        TransactionStatus::Canceled
                    } else {
                        TransactionStatus::Stuck
                    };
                    self.transition(transaction_id, next).await?;
                }
                terminal => return Ok(terminal),
            }
        }
    }

    /// Calls Try on every participant in registration order, stopping at the
    /// first failure. Returns the status to move to.
    async fn run_try(&self, snapshot: &TransactionContext) -> Result<TransactionStatus> {
        let transaction_id = snapshot.transaction_id();
        let context = Arc::new(snapshot.context().clone());

        for participant_id in snapshot.participants() {
            match snapshot.outcome(participant_id, Phase::Try) {
                PhaseOutcome::Success => continue,
                PhaseOutcome::Failed => return Ok(TransactionStatus::Canceling),
                PhaseOutcome::Pending => {}
            }

            let participant = self.resolve(transaction_id, participant_id).await?;
            let attempt = snapshot.attempts(participant_id, Phase::Try) + 1;
            if self
                .attempt(transaction_id, &participant, Phase::Try, attempt, &context)
                .await?
                .is_err()
            {
                return Ok(TransactionStatus::Canceling);
            }
        }

        Ok(TransactionStatus::Confirming)
    }

    /// Runs Confirm or Cancel until every target succeeded or gave up.
    /// Returns true if every target succeeded.
    async fn complete_phase(
        self: &Arc<Self>,
        snapshot: &TransactionContext,
        phase: Phase,
    ) -> Result<bool> {
        let targets: Vec<ParticipantId> = match phase {
            Phase::Cancel => snapshot.cancel_targets(),
            _ => snapshot.participants().to_vec(),
        }
        .into_iter()
        .filter(|p| snapshot.outcome(p, phase) != PhaseOutcome::Success)
        .collect();
        let context = Arc::new(snapshot.context().clone());

        let parallel = phase == Phase::Confirm
            && self.config.confirm_parallelism == ConfirmParallelism::Parallel;

        let completions = if parallel {
            join_all(
                targets
                    .iter()
                    .map(|p| self.start_participant(snapshot, p, phase, &context)),
            )
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?
        } else {
            let mut completions = Vec::with_capacity(targets.len());
            for participant_id in &targets {
                completions.push(
                    self.start_participant(snapshot, participant_id, phase, &context)
                        .await?,
                );
            }
            completions
        };

        let mut all_succeeded = true;
        for completion in completions {
            if let Completion::Retrying(handle) = completion
                && !handle.resolution().await?.is_succeeded()
            {
                all_succeeded = false;
            }
        }
        Ok(all_succeeded)
    }

    /// Makes the first attempt inline and hands failures to the retry scheduler.
    async fn start_participant(
        self: &Arc<Self>,
        snapshot: &TransactionContext,
        participant_id: &ParticipantId,
        phase: Phase,
        context: &Arc<ContextMap>,
    ) -> Result<Completion> {
        let transaction_id = snapshot.transaction_id();
        let participant = self.resolve(transaction_id, participant_id).await?;
        let attempt = snapshot.attempts(participant_id, phase) + 1;

        match self
            .attempt(transaction_id, &participant, phase, attempt, context)
            .await?
        {
            Ok(()) => Ok(Completion::Done),
            Err(last_error) => {
                let request = RetryRequest {
                    transaction_id,
                    participant_id: participant_id.clone(),
                    phase,
                    attempts_made: attempt,
                    last_error,
                };
                let operation =
                    self.retry_operation(transaction_id, participant, phase, Arc::clone(context));
                Ok(Completion::Retrying(
                    self.scheduler.schedule(request, operation)?,
                ))
            }
        }
    }

    fn retry_operation(
        self: &Arc<Self>,
        transaction_id: TransactionId,
        participant: Arc<dyn Participant>,
        phase: Phase,
        context: Arc<ContextMap>,
    ) -> RetryOperation {
        let inner = Arc::clone(self);
        Arc::new(move |attempt: u32| {
            let inner = Arc::clone(&inner);
            let participant = Arc::clone(&participant);
            let context = Arc::clone(&context);
            async move {
                inner
                    .attempt(transaction_id, &participant, phase, attempt, &context)
                    .await
                    .unwrap_or_else(|error| {
                        Err(ParticipantError::transient(format!(
                            "failed to log attempt: {error}"
                        )))
                    })
            }
            .boxed()
        })
    }

    /// Calls one participant once and logs the outcome.
    async fn attempt(
        &self,
        transaction_id: TransactionId,
        participant: &Arc<dyn Participant>,
        phase: Phase,
        attempt: u32,
        context: &Arc<ContextMap>,
    ) -> Result<PhaseResult> {
        let participant_id = participant.participant_id();
        let result = self
            .dispatcher
            .call(Arc::clone(participant), phase, transaction_id, Arc::clone(context))
            .await;

        let (outcome, reason) = match &result {
            Ok(()) => {
                tracing::debug!(%transaction_id, %participant_id, %phase, attempt, "phase call succeeded");
                (PhaseOutcome::Success, None)
            }
            Err(error) => {
                tracing::warn!(%transaction_id, %participant_id, %phase, attempt, %error, "phase call failed");
                (PhaseOutcome::Failed, Some(error.to_string()))
            }
        };

        self.append_for(
            transaction_id,
            LogRecord::phase_attempt(phase, participant_id, outcome, attempt, reason),
        )
        .await?;
        Ok(result)
    }

    async fn resolve(
        &self,
        transaction_id: TransactionId,
        participant_id: &ParticipantId,
    ) -> Result<Arc<dyn Participant>> {
        self.directory
            .read()
            .await
            .get(participant_id)
            .cloned()
            .ok_or_else(|| TccError::UnknownParticipant {
                transaction_id,
                participant_id: participant_id.clone(),
            })
    }
}
