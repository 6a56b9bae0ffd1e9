//! The generation job aggregate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lumagen_core::{JobId, JobKind, JobState, ProviderTaskId, UserId};

/// One generation request and its lifecycle.
///
/// Created at submission time with credits already debited; mutated only by
/// the task synchronizer; immutable once terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub user_id: UserId,
    pub kind: JobKind,
    pub model: String,
    /// Opaque to the core; forwarded to the provider as-is.
    pub request_params: serde_json::Value,
    /// Vendor-assigned id; set once the submit call succeeds.
    pub provider_task_id: Option<ProviderTaskId>,
    pub state: JobState,
    pub result_assets: Vec<String>,
    pub failure_reason: Option<String>,
    pub credits_charged: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    pub fn new(
        id: JobId,
        user_id: UserId,
        kind: JobKind,
        model: impl Into<String>,
        request_params: serde_json::Value,
        credits_charged: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            kind,
            model: model.into(),
            request_params,
            provider_task_id: None,
            state: JobState::Queued,
            result_assets: Vec::new(),
            failure_reason: None,
            credits_charged,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Wall-clock time since submission.
    pub fn elapsed(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }
}
