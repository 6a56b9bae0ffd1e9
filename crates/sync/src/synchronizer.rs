//! The task synchronizer.

use tracing::{info, instrument, warn};

use lumagen_core::{GenerationError, GenerationResult, JobId, JobState};
use lumagen_credits::CreditLedger;
use lumagen_gateway::TaskObservation;
use lumagen_jobs::{FinalizeOutcome, GenerationJob, JobStore};

use crate::notifier::{JobNotification, Notifier};

/// What applying an observation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The job was already terminal; nothing was written or fired.
    AlreadyTerminal,
    /// Non-terminal observation; only progress metadata moved.
    InFlight(JobState),
    /// This call won the terminal transition and ran the side effects.
    Finalized(GenerationJob),
}

/// Reconciles canonical observations into the system of record exactly once
/// per terminal transition, no matter how many times or by which path (poll
/// loop, inbound webhook, manual replay) the terminal state is observed.
pub struct TaskSynchronizer<S, L, N> {
    store: S,
    ledger: L,
    notifier: N,
}

impl<S, L, N> TaskSynchronizer<S, L, N>
where
    S: JobStore,
    L: CreditLedger,
    N: Notifier,
{
    pub fn new(store: S, ledger: L, notifier: N) -> Self {
        Self {
            store,
            ledger,
            notifier,
        }
    }

    /// Apply one observation to the job with this vendor task id.
    ///
    /// Entry point for inbound webhooks, which only know the task id.
    pub async fn apply_by_task_id(
        &self,
        task_id: &str,
        observation: &TaskObservation,
    ) -> GenerationResult<SyncOutcome> {
        let job = self
            .store
            .find_by_task_id(task_id)
            .await?
            .ok_or(GenerationError::NotFound)?;
        self.apply(job.id, observation).await
    }

    /// Apply one observation to one job.
    #[instrument(skip(self, observation), fields(job_id = %job_id, observed = %observation.state))]
    pub async fn apply(
        &self,
        job_id: JobId,
        observation: &TaskObservation,
    ) -> GenerationResult<SyncOutcome> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(GenerationError::NotFound)?;

        // Duplicate terminal observations are expected (poll vs webhook vs
        // replay); they must be silent no-ops.
        if job.state.is_terminal() {
            return Ok(SyncOutcome::AlreadyTerminal);
        }

        match observation.state {
            JobState::Queued => Ok(SyncOutcome::InFlight(job.state)),
            JobState::Processing => {
                self.store.mark_processing(job_id).await?;
                Ok(SyncOutcome::InFlight(JobState::Processing))
            }
            JobState::Success => {
                // A "success" with nothing to show is a failure: the user
                // must get their credits back, not an empty library entry.
                if observation.result_assets.is_empty() {
                    return self
                        .finalize_failed(job_id, "provider reported success with no results")
                        .await;
                }
                self.finalize_success(job_id, &observation.result_assets).await
            }
            JobState::Failed => {
                let reason = observation
                    .failure_reason
                    .as_deref()
                    .unwrap_or("generation failed");
                self.finalize_failed(job_id, reason).await
            }
        }
    }

    async fn finalize_success(
        &self,
        job_id: JobId,
        result_assets: &[String],
    ) -> GenerationResult<SyncOutcome> {
        match self.store.finalize_success(job_id, result_assets).await? {
            FinalizeOutcome::AlreadyTerminal => Ok(SyncOutcome::AlreadyTerminal),
            FinalizeOutcome::Finalized(job) => {
                info!(%job_id, assets = job.result_assets.len(), "job succeeded");
                // The notification is coupled to the CAS win: racing callers
                // that lost the guard never get here.
                self.notifier.notify(JobNotification::from_job(&job)).await;
                Ok(SyncOutcome::Finalized(job))
            }
        }
    }

    async fn finalize_failed(&self, job_id: JobId, reason: &str) -> GenerationResult<SyncOutcome> {
        match self.store.finalize_failed(job_id, reason).await? {
            FinalizeOutcome::AlreadyTerminal => Ok(SyncOutcome::AlreadyTerminal),
            FinalizeOutcome::Finalized(job) => {
                warn!(%job_id, reason, "job failed");
                if job.credits_charged > 0 {
                    // Idempotent on its own guard as well; a crash between
                    // the CAS win and this call is healed by replaying the
                    // observation.
                    self.ledger
                        .refund(
                            job.user_id,
                            job.credits_charged,
                            job.id,
                            &format!("refund: {reason}"),
                        )
                        .await?;
                }
                self.notifier.notify(JobNotification::from_job(&job)).await;
                Ok(SyncOutcome::Finalized(job))
            }
        }
    }
}
