//! Background reconciliation sweep.
//!
//! Jobs can outlive their poll budget (long videos), miss their webhook, or
//! be orphaned by a crash between debit and submit. The worker periodically
//! re-syncs stale non-terminal jobs so every job eventually reaches a
//! genuine terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lumagen_credits::CreditLedger;
use lumagen_gateway::{ProviderRouter, TaskObservation};
use lumagen_jobs::JobStore;

use crate::notifier::Notifier;
use crate::poller::sync_once;
use crate::synchronizer::TaskSynchronizer;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Pause between sweeps.
    pub interval: Duration,
    /// Only jobs untouched for at least this long are swept.
    pub stale_after: Duration,
    /// Maximum jobs per sweep.
    pub batch: usize,
    /// A stale job that never got a provider task id can only come from an
    /// interrupted submission; after this grace it is failed and refunded.
    pub orphan_grace: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            batch: 20,
            orphan_grace: Duration::from_secs(300),
        }
    }
}

/// Handle to control a running reconciliation worker.
#[derive(Debug)]
pub struct ReconcileWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl ReconcileWorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(()).await;
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

pub struct ReconcileWorker;

impl ReconcileWorker {
    pub fn spawn<S, L, N>(
        store: S,
        router: ProviderRouter,
        synchronizer: Arc<TaskSynchronizer<S, L, N>>,
        config: ReconcileConfig,
    ) -> ReconcileWorkerHandle
    where
        S: JobStore + Clone + 'static,
        L: CreditLedger + 'static,
        N: Notifier + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let join = tokio::spawn(async move {
            info!("reconciliation worker started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(config.interval) => {
                        sweep(&store, &router, &synchronizer, &config).await;
                    }
                }
            }
            info!("reconciliation worker stopped");
        });

        ReconcileWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

async fn sweep<S, L, N>(
    store: &S,
    router: &ProviderRouter,
    synchronizer: &TaskSynchronizer<S, L, N>,
    config: &ReconcileConfig,
) where
    S: JobStore,
    L: CreditLedger,
    N: Notifier,
{
    let stale_before = Utc::now()
        - chrono::Duration::from_std(config.stale_after).unwrap_or(chrono::Duration::zero());

    let jobs = match store.list_unfinished(stale_before, config.batch).await {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "reconciliation sweep could not list jobs");
            return;
        }
    };
    if jobs.is_empty() {
        return;
    }
    debug!(count = jobs.len(), "reconciliation sweep");

    for job in jobs {
        if job.provider_task_id.is_none() {
            let age = job.elapsed(Utc::now());
            if age >= config.orphan_grace {
                warn!(job_id = %job.id, age_secs = age.as_secs(), "failing orphaned job");
                if let Err(e) = synchronizer
                    .apply(
                        job.id,
                        &TaskObservation::failed("submission was interrupted"),
                    )
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "orphan finalization failed");
                }
            }
            continue;
        }

        let gateway = match router.for_kind(job.kind) {
            Ok(g) => g,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "no gateway for stale job");
                continue;
            }
        };

        if let Err(e) = sync_once(gateway.as_ref(), synchronizer, &job).await {
            // Transient errors are fine: the next sweep retries.
            debug!(job_id = %job.id, error = %e, "stale job re-sync failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lumagen_core::{JobId, JobKind, JobState, ProviderTaskId, UserId};
    use lumagen_credits::{CreditLedger as _, EntryType, InMemoryCreditLedger};
    use lumagen_gateway::MockProvider;
    use lumagen_jobs::{GenerationJob, InMemoryJobStore, JobStore as _};

    use crate::notifier::RecordingNotifier;

    #[tokio::test]
    async fn sweep_finalizes_stale_jobs_from_provider_state() {
        let store = InMemoryJobStore::arc();
        let ledger = InMemoryCreditLedger::arc();
        let notifier = RecordingNotifier::arc();
        let synchronizer = Arc::new(TaskSynchronizer::new(
            store.clone(),
            ledger.clone(),
            notifier.clone(),
        ));

        let user = UserId::new();
        ledger.grant(user, 100, EntryType::Bonus, "test").await.unwrap();

        // A job that went stale mid-processing.
        let mut job = GenerationJob::new(
            JobId::new(),
            user,
            JobKind::Photo,
            "test/model",
            serde_json::json!({ "prompt": "x" }),
            10,
        );
        job.updated_at = Utc::now() - chrono::Duration::minutes(5);
        let job_id = job.id;
        ledger.debit(user, 10, job_id, "debit").await.unwrap();
        store.insert(job).await.unwrap();
        store
            .set_provider_task(job_id, &ProviderTaskId::new("task_stale"))
            .await
            .unwrap();
        let mock = Arc::new(MockProvider::new("mock"));
        mock.script_poll(
            "task_stale",
            [TaskObservation::success(vec!["https://cdn/a.png".into()])],
        );
        let router = ProviderRouter::new().with_gateway(JobKind::Photo, mock.clone());

        let config = ReconcileConfig {
            interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(0),
            batch: 10,
            orphan_grace: Duration::from_secs(300),
        };

        let handle = ReconcileWorker::spawn(store.clone(), router, synchronizer, config);

        // Give the worker a couple of sweep cycles.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Success);
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn orphaned_jobs_are_failed_and_refunded_after_grace() {
        let store = InMemoryJobStore::arc();
        let ledger = InMemoryCreditLedger::arc();
        let notifier = RecordingNotifier::arc();
        let synchronizer = Arc::new(TaskSynchronizer::new(
            store.clone(),
            ledger.clone(),
            notifier.clone(),
        ));

        let user = UserId::new();
        ledger.grant(user, 100, EntryType::Bonus, "test").await.unwrap();

        // Debited, inserted, but the process died before the submit call:
        // no provider task id, and well past the orphan grace.
        let mut job = GenerationJob::new(
            JobId::new(),
            user,
            JobKind::Photo,
            "test/model",
            serde_json::json!({ "prompt": "x" }),
            10,
        );
        job.created_at = Utc::now() - chrono::Duration::minutes(30);
        job.updated_at = job.created_at;
        let job_id = job.id;
        ledger.debit(user, 10, job_id, "debit").await.unwrap();
        store.insert(job).await.unwrap();

        let router = ProviderRouter::new();
        let config = ReconcileConfig {
            interval: Duration::from_millis(10),
            stale_after: Duration::from_millis(0),
            batch: 10,
            orphan_grace: Duration::from_secs(60),
        };

        let handle = ReconcileWorker::spawn(store.clone(), router, synchronizer, config);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let job = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(ledger.balance(user).await.unwrap(), 100);
        assert_eq!(notifier.count(), 1);
    }
}
