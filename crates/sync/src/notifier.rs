//! Terminal-transition notifications.
//!
//! The synchronizer guarantees single delivery per job, so consumers can be
//! written without their own dedup.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use lumagen_core::{JobId, JobKind, JobState, UserId};
use lumagen_jobs::GenerationJob;

/// Payload delivered once per finalized job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotification {
    pub job_id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub state: JobState,
    pub result_assets: Vec<String>,
    pub failure_reason: Option<String>,
}

impl JobNotification {
    pub fn from_job(job: &GenerationJob) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id,
            kind: job.kind,
            state: job.state,
            result_assets: job.result_assets.clone(),
            failure_reason: job.failure_reason.clone(),
        }
    }
}

/// Downstream consumer of terminal transitions.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: JobNotification);
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    async fn notify(&self, notification: JobNotification) {
        (**self).notify(notification).await
    }
}

/// Fans notifications out over a broadcast channel (lossy; no backpressure
/// on the synchronizer). The SSE stream subscribes here.
#[derive(Debug)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<JobNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobNotification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notification: JobNotification) {
        let _ = self.tx.send(notification);
    }
}

/// Collects notifications for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    inner: Mutex<Vec<JobNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> Vec<JobNotification> {
        self.inner.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: JobNotification) {
        self.inner.lock().unwrap().push(notification);
    }
}
