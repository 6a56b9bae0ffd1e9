//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use lumagen_core::{GenerationError, GenerationResult, JobId, JobState, ProviderTaskId, UserId};

use crate::types::GenerationJob;

/// Result of a guarded terminal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// This caller won the compare-and-swap; the updated job is returned so
    /// the winner can run its coupled side effects exactly once.
    Finalized(GenerationJob),
    /// Another actor already finalized the job; nothing was written.
    AlreadyTerminal,
}

/// System of record for generation jobs.
///
/// Terminal transitions use conditional writes that only succeed from a
/// non-terminal state; implementations must make that guard atomic.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly created job (state must be `Queued`).
    async fn insert(&self, job: GenerationJob) -> GenerationResult<()>;

    async fn get(&self, job_id: JobId) -> GenerationResult<Option<GenerationJob>>;

    /// Look a job up by its vendor task id (newest first on duplicates).
    async fn find_by_task_id(&self, task_id: &str) -> GenerationResult<Option<GenerationJob>>;

    /// Record the vendor task id after a successful submit.
    async fn set_provider_task(
        &self,
        job_id: JobId,
        task_id: &ProviderTaskId,
    ) -> GenerationResult<()>;

    /// Move a non-terminal job to `Processing`. No-op when already terminal.
    async fn mark_processing(&self, job_id: JobId) -> GenerationResult<()>;

    /// CAS transition to `Success` with the result assets.
    async fn finalize_success(
        &self,
        job_id: JobId,
        result_assets: &[String],
    ) -> GenerationResult<FinalizeOutcome>;

    /// CAS transition to `Failed` with a human-readable reason.
    async fn finalize_failed(
        &self,
        job_id: JobId,
        reason: &str,
    ) -> GenerationResult<FinalizeOutcome>;

    /// A user's jobs, newest first.
    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>>;

    /// Non-terminal jobs last touched before `stale_before`, oldest first.
    /// Feed for the reconciliation sweep.
    async fn list_unfinished(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>>;
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, GenerationJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn finalize(
        &self,
        job_id: JobId,
        apply: impl FnOnce(&mut GenerationJob),
    ) -> GenerationResult<FinalizeOutcome> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(GenerationError::NotFound)?;

        if job.state.is_terminal() {
            return Ok(FinalizeOutcome::AlreadyTerminal);
        }

        let now = Utc::now();
        apply(job);
        job.updated_at = now;
        job.finalized_at = Some(now);
        debug!(%job_id, state = %job.state, "job finalized");
        Ok(FinalizeOutcome::Finalized(job.clone()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: GenerationJob) -> GenerationResult<()> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(GenerationError::conflict(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> GenerationResult<Option<GenerationJob>> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn find_by_task_id(&self, task_id: &str) -> GenerationResult<Option<GenerationJob>> {
        let jobs = self.jobs.read().unwrap();
        // Retries can leave several jobs with one task id; pick the newest.
        Ok(jobs
            .values()
            .filter(|j| {
                j.provider_task_id
                    .as_ref()
                    .is_some_and(|t| t.as_str() == task_id)
            })
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn set_provider_task(
        &self,
        job_id: JobId,
        task_id: &ProviderTaskId,
    ) -> GenerationResult<()> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(GenerationError::NotFound)?;
        if job.state.is_terminal() {
            return Err(GenerationError::conflict("job already finalized"));
        }
        job.provider_task_id = Some(task_id.clone());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_processing(&self, job_id: JobId) -> GenerationResult<()> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(GenerationError::NotFound)?;
        if job.state.is_terminal() {
            return Ok(());
        }
        job.state = JobState::Processing;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn finalize_success(
        &self,
        job_id: JobId,
        result_assets: &[String],
    ) -> GenerationResult<FinalizeOutcome> {
        self.finalize(job_id, |job| {
            job.state = JobState::Success;
            job.result_assets = result_assets.to_vec();
            job.failure_reason = None;
        })
    }

    async fn finalize_failed(
        &self,
        job_id: JobId,
        reason: &str,
    ) -> GenerationResult<FinalizeOutcome> {
        self.finalize(job_id, |job| {
            job.state = JobState::Failed;
            job.failure_reason = Some(reason.to_string());
        })
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_unfinished(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| !j.state.is_terminal() && j.updated_at < stale_before)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.updated_at);
        result.truncate(limit);
        Ok(result)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn insert(&self, job: GenerationJob) -> GenerationResult<()> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> GenerationResult<Option<GenerationJob>> {
        (**self).get(job_id).await
    }

    async fn find_by_task_id(&self, task_id: &str) -> GenerationResult<Option<GenerationJob>> {
        (**self).find_by_task_id(task_id).await
    }

    async fn set_provider_task(
        &self,
        job_id: JobId,
        task_id: &ProviderTaskId,
    ) -> GenerationResult<()> {
        (**self).set_provider_task(job_id, task_id).await
    }

    async fn mark_processing(&self, job_id: JobId) -> GenerationResult<()> {
        (**self).mark_processing(job_id).await
    }

    async fn finalize_success(
        &self,
        job_id: JobId,
        result_assets: &[String],
    ) -> GenerationResult<FinalizeOutcome> {
        (**self).finalize_success(job_id, result_assets).await
    }

    async fn finalize_failed(
        &self,
        job_id: JobId,
        reason: &str,
    ) -> GenerationResult<FinalizeOutcome> {
        (**self).finalize_failed(job_id, reason).await
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>> {
        (**self).list_for_user(user_id, limit).await
    }

    async fn list_unfinished(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> GenerationResult<Vec<GenerationJob>> {
        (**self).list_unfinished(stale_before, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumagen_core::JobKind;

    fn test_job() -> GenerationJob {
        GenerationJob::new(
            JobId::new(),
            UserId::new(),
            JobKind::Photo,
            "test/model",
            serde_json::json!({ "prompt": "a red door" }),
            10,
        )
    }

    #[tokio::test]
    async fn finalize_success_wins_once() {
        let store = InMemoryJobStore::new();
        let job = test_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let assets = vec!["https://cdn/a.png".to_string()];
        let first = store.finalize_success(id, &assets).await.unwrap();
        let FinalizeOutcome::Finalized(updated) = first else {
            panic!("first finalize must win");
        };
        assert_eq!(updated.state, JobState::Success);
        assert_eq!(updated.result_assets, assets);
        assert!(updated.finalized_at.is_some());

        // A second observer, via either path, is a no-op.
        let second = store.finalize_success(id, &assets).await.unwrap();
        assert_eq!(second, FinalizeOutcome::AlreadyTerminal);
        let third = store.finalize_failed(id, "late failure").await.unwrap();
        assert_eq!(third, FinalizeOutcome::AlreadyTerminal);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Success);
        assert!(job.failure_reason.is_none());
    }

    #[tokio::test]
    async fn concurrent_finalizers_produce_exactly_one_winner() {
        let store = InMemoryJobStore::arc();
        let job = test_job();
        let id = job.id;
        store.insert(job).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    store
                        .finalize_success(id, &["https://cdn/a.png".to_string()])
                        .await
                        .unwrap()
                } else {
                    store.finalize_failed(id, "provider failed").await.unwrap()
                }
            }));
        }

        let mut winners = 0;
        for h in handles {
            if matches!(h.await.unwrap(), FinalizeOutcome::Finalized(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_progress_and_task_writes() {
        let store = InMemoryJobStore::new();
        let job = test_job();
        let id = job.id;
        store.insert(job).await.unwrap();
        store.finalize_failed(id, "boom").await.unwrap();

        // mark_processing is an idempotent no-op on terminal jobs.
        store.mark_processing(id).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Failed);

        let err = store
            .set_provider_task(id, &ProviderTaskId::new("task_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Conflict(_)));
    }

    #[tokio::test]
    async fn find_by_task_id_prefers_newest() {
        let store = InMemoryJobStore::new();

        let mut old = test_job();
        old.created_at = Utc::now() - chrono::Duration::minutes(5);
        let old_id = old.id;
        store.insert(old).await.unwrap();
        store
            .set_provider_task(old_id, &ProviderTaskId::new("task_dup"))
            .await
            .unwrap();

        let new = test_job();
        let new_id = new.id;
        store.insert(new).await.unwrap();
        store
            .set_provider_task(new_id, &ProviderTaskId::new("task_dup"))
            .await
            .unwrap();

        let found = store.find_by_task_id("task_dup").await.unwrap().unwrap();
        assert_eq!(found.id, new_id);
    }

    #[tokio::test]
    async fn unfinished_sweep_skips_terminal_and_fresh_jobs() {
        let store = InMemoryJobStore::new();

        // Insert preserves the job as given; backdate before inserting.
        let mut stale = test_job();
        stale.updated_at = Utc::now() - chrono::Duration::minutes(10);
        let stale_id = stale.id;
        store.insert(stale).await.unwrap();

        let fresh = test_job();
        store.insert(fresh).await.unwrap();

        let done = test_job();
        let done_id = done.id;
        store.insert(done).await.unwrap();
        store.finalize_failed(done_id, "x").await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(1);
        let swept = store.list_unfinished(cutoff, 10).await.unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, stale_id);
    }
}
