//! Scriptable in-process provider for tests and dev wiring.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use lumagen_core::{GenerationError, GenerationResult, ProviderTaskId};

use crate::provider::{ProviderGateway, SubmitRequest, TaskObservation};

/// Provider whose submit results and poll observations are scripted ahead of
/// time. The last scripted observation for a task repeats forever, so a
/// terminal state stays terminal across re-polls.
pub struct MockProvider {
    name: String,
    submit_results: Mutex<VecDeque<GenerationResult<ProviderTaskId>>>,
    poll_scripts: Mutex<HashMap<String, VecDeque<TaskObservation>>>,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
    submit_delay: Option<Duration>,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            submit_results: Mutex::new(VecDeque::new()),
            poll_scripts: Mutex::new(HashMap::new()),
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
            submit_delay: None,
        }
    }

    /// Delay every submit call (for exercising call timeouts).
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    /// Queue the result of the next submit call.
    pub fn enqueue_submit(&self, result: GenerationResult<ProviderTaskId>) {
        self.submit_results.lock().unwrap().push_back(result);
    }

    /// Script the observations a task will go through, in order.
    pub fn script_poll(
        &self,
        task_id: impl Into<String>,
        observations: impl IntoIterator<Item = TaskObservation>,
    ) {
        self.poll_scripts
            .lock()
            .unwrap()
            .insert(task_id.into(), observations.into_iter().collect());
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderGateway for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, _request: &SubmitRequest) -> GenerationResult<ProviderTaskId> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        self.submit_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(GenerationError::provider_unavailable(
                    "no scripted submit result",
                ))
            })
    }

    async fn poll(&self, task_id: &ProviderTaskId) -> GenerationResult<TaskObservation> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.poll_scripts.lock().unwrap();
        let Some(queue) = scripts.get_mut(task_id.as_str()) else {
            return Err(GenerationError::provider_unavailable(format!(
                "no scripted observations for {task_id}"
            )));
        };

        match queue.len() {
            0 => Err(GenerationError::provider_unavailable(format!(
                "script for {task_id} exhausted"
            ))),
            1 => Ok(queue
                .front()
                .cloned()
                .unwrap_or_else(TaskObservation::processing)),
            _ => Ok(queue
                .pop_front()
                .unwrap_or_else(TaskObservation::processing)),
        }
    }
}
