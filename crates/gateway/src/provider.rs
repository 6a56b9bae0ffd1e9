//! Gateway contract and the canonical observation model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use lumagen_core::{GenerationResult, JobKind, JobState, ProviderTaskId};

/// A unit of work handed to a provider.
///
/// `input` is opaque to the core: the adapter forwards it to the vendor
/// as-is, so new model parameters never require a core change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub kind: JobKind,
    pub model: String,
    pub input: serde_json::Value,
    /// Where the vendor should deliver its completion callback, if it can.
    pub callback_url: Option<String>,
}

/// One provider-agnostic status observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskObservation {
    pub state: JobState,
    pub result_assets: Vec<String>,
    pub failure_reason: Option<String>,
    /// Vendor-reported progress, when the vendor has one.
    pub progress: Option<u8>,
}

impl TaskObservation {
    pub fn queued() -> Self {
        Self {
            state: JobState::Queued,
            result_assets: Vec::new(),
            failure_reason: None,
            progress: None,
        }
    }

    pub fn processing() -> Self {
        Self {
            state: JobState::Processing,
            result_assets: Vec::new(),
            failure_reason: None,
            progress: None,
        }
    }

    pub fn success(result_assets: Vec<String>) -> Self {
        Self {
            state: JobState::Success,
            result_assets,
            failure_reason: None,
            progress: Some(100),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            result_assets: Vec::new(),
            failure_reason: Some(reason.into()),
            progress: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Join sub-task observations into one canonical observation.
    ///
    /// Success only when every sub-task succeeded (assets concatenated in
    /// sub-task order); Failed as soon as any sub-task terminally failed;
    /// Processing otherwise, with progress averaged over the batch.
    pub fn join(parts: &[TaskObservation]) -> TaskObservation {
        if parts.is_empty() {
            return TaskObservation::processing();
        }

        if let Some(failed) = parts.iter().find(|p| p.state == JobState::Failed) {
            return TaskObservation::failed(
                failed
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "sub-task failed".to_string()),
            );
        }

        if parts.iter().all(|p| p.state == JobState::Success) {
            let assets = parts
                .iter()
                .flat_map(|p| p.result_assets.iter().cloned())
                .collect();
            return TaskObservation::success(assets);
        }

        let progress_sum: u32 = parts
            .iter()
            .map(|p| u32::from(p.progress.unwrap_or(0)))
            .sum();
        let mut joined = TaskObservation::processing();
        joined.progress = Some((progress_sum / parts.len() as u32).min(100) as u8);
        joined
    }
}

/// Uniform interface over one vendor API.
///
/// Implementations must keep `poll` side-effect-free and callable any number
/// of times; nothing here writes to the job store.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Short vendor name used in provider keys, e.g. `"kie"`.
    fn name(&self) -> &str;

    /// Submit a job; returns the vendor task id (possibly composite).
    async fn submit(&self, request: &SubmitRequest) -> GenerationResult<ProviderTaskId>;

    /// Fetch the current canonical state of a task.
    async fn poll(&self, task_id: &ProviderTaskId) -> GenerationResult<TaskObservation>;
}

#[async_trait]
impl<G: ProviderGateway + ?Sized> ProviderGateway for std::sync::Arc<G> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn submit(&self, request: &SubmitRequest) -> GenerationResult<ProviderTaskId> {
        (**self).submit(request).await
    }

    async fn poll(&self, task_id: &ProviderTaskId) -> GenerationResult<TaskObservation> {
        (**self).poll(task_id).await
    }
}
