//! Bounded polling against a provider gateway.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use lumagen_core::{GenerationResult, JobKind};
use lumagen_credits::CreditLedger;
use lumagen_gateway::ProviderGateway;
use lumagen_jobs::{GenerationJob, JobStore};

use crate::notifier::Notifier;
use crate::synchronizer::{SyncOutcome, TaskSynchronizer};

/// Poll cadence and wall-clock budget for one job kind.
///
/// Video tolerates a much longer budget than photo. Exhausting the budget is
/// not a failure: the job stays `Processing` for the reconciliation sweep.
#[derive(Debug, Clone, Copy)]
pub struct PollBudget {
    pub interval: Duration,
    pub budget: Duration,
}

impl PollBudget {
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Photo => Self {
                interval: Duration::from_secs(2),
                budget: Duration::from_secs(120),
            },
            JobKind::Video => Self {
                interval: Duration::from_secs(3),
                budget: Duration::from_secs(600),
            },
            JobKind::Audio => Self {
                interval: Duration::from_secs(2),
                budget: Duration::from_secs(180),
            },
        }
    }
}

/// Poll the provider once and reconcile the observation.
///
/// Transient provider errors leave the job untouched; the next pass retries.
pub async fn sync_once<G, S, L, N>(
    gateway: &G,
    synchronizer: &TaskSynchronizer<S, L, N>,
    job: &GenerationJob,
) -> GenerationResult<SyncOutcome>
where
    G: ProviderGateway + ?Sized,
    S: JobStore,
    L: CreditLedger,
    N: Notifier,
{
    let Some(task_id) = &job.provider_task_id else {
        // Nothing to ask the provider about yet.
        return Ok(SyncOutcome::InFlight(job.state));
    };

    let observation = gateway.poll(task_id).await?;
    synchronizer.apply(job.id, &observation).await
}

/// Poll on a bounded interval until the job reaches a terminal state or the
/// budget runs out.
///
/// A fatal error is never synthesized from a timeout; absence of evidence is
/// not evidence of failure. Retryable poll errors (provider blips, open
/// circuit) are waited out inside the same budget.
pub async fn poll_until_terminal<G, S, L, N>(
    gateway: &G,
    synchronizer: &TaskSynchronizer<S, L, N>,
    job: &GenerationJob,
    budget: PollBudget,
) -> GenerationResult<SyncOutcome>
where
    G: ProviderGateway + ?Sized,
    S: JobStore,
    L: CreditLedger,
    N: Notifier,
{
    let started = Instant::now();
    let mut last = SyncOutcome::InFlight(job.state);

    loop {
        match sync_once(gateway, synchronizer, job).await {
            Ok(outcome @ (SyncOutcome::Finalized(_) | SyncOutcome::AlreadyTerminal)) => {
                return Ok(outcome);
            }
            Ok(outcome) => {
                last = outcome;
            }
            Err(e) if e.is_retryable() => {
                debug!(job_id = %job.id, error = %e, "poll attempt failed, will retry");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "poll failed with non-retryable error");
                return Err(e);
            }
        }

        if started.elapsed() + budget.interval > budget.budget {
            debug!(job_id = %job.id, "poll budget exhausted, leaving job for reconciliation");
            return Ok(last);
        }
        tokio::time::sleep(budget.interval).await;
    }
}
