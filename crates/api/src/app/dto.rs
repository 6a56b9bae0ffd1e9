use axum::http::StatusCode;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use lumagen_core::{progress, JobState};
use lumagen_credits::LedgerEntry;
use lumagen_jobs::GenerationJob;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// photo | video | audio (image accepted as an alias of photo).
    pub kind: String,
    pub model: String,
    /// Convenience: a bare prompt becomes `{ "prompt": ... }`.
    pub prompt: Option<String>,
    /// Full vendor input object; wins over `prompt` when both are present.
    pub input: Option<serde_json::Value>,
}

impl GenerateRequest {
    /// Build the opaque provider input.
    pub fn into_input(self) -> Result<serde_json::Value, axum::response::Response> {
        if let Some(input) = self.input {
            if !input.is_object() {
                return Err(errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "input must be a JSON object",
                ));
            }
            return Ok(input);
        }
        match self.prompt {
            Some(prompt) if !prompt.trim().is_empty() => Ok(json!({ "prompt": prompt })),
            _ => Err(errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "either prompt or input is required",
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GrantCreditsRequest {
    pub user_id: lumagen_core::UserId,
    pub amount: i64,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CircuitResetRequest {
    /// Provider key to reset; omitted resets every breaker.
    pub key: Option<String>,
}

/// Canonical inbound callback shape; tolerant of the vendor nesting the
/// payload under `data` and of snake_case task id spellings.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "taskId", alias = "task_id")]
    pub task_id: Option<String>,
    pub state: Option<String>,
    #[serde(rename = "resultUrls", alias = "result_urls")]
    pub result_urls: Option<Vec<String>>,
    #[serde(rename = "failureReason", alias = "failure_reason", alias = "failMsg")]
    pub failure_reason: Option<String>,
    pub data: Option<Box<WebhookPayload>>,
}

impl WebhookPayload {
    /// Flatten the optional `data` nesting: inner fields win.
    pub fn flatten(self) -> WebhookPayload {
        match self.data {
            Some(inner) => {
                let inner = inner.flatten();
                WebhookPayload {
                    task_id: inner.task_id.or(self.task_id),
                    state: inner.state.or(self.state),
                    result_urls: inner.result_urls.or(self.result_urls),
                    failure_reason: inner.failure_reason.or(self.failure_reason),
                    data: None,
                }
            }
            None => self,
        }
    }
}

// -------------------------
// Response JSON
// -------------------------

pub fn job_to_status_json(job: &GenerationJob) -> serde_json::Value {
    let expected = job.kind.expected_duration();
    let elapsed = job.elapsed(Utc::now());

    let (progress_pct, eta_seconds) = match job.state {
        JobState::Success | JobState::Failed => (100, None),
        JobState::Queued | JobState::Processing => (
            progress::estimate(elapsed, expected),
            progress::eta_seconds(elapsed, expected),
        ),
    };

    json!({
        "id": job.id,
        "status": job.state,
        "kind": job.kind,
        "model": job.model,
        "progress": progress_pct,
        "etaSeconds": eta_seconds,
        "taskId": job.provider_task_id,
        "resultUrls": job.result_assets,
        "resultUrl": job.result_assets.first(),
        "error": job.failure_reason,
        "creditsCharged": job.credits_charged,
        "createdAt": job.created_at,
        "finalizedAt": job.finalized_at,
    })
}

pub fn ledger_entry_to_json(entry: &LedgerEntry) -> serde_json::Value {
    json!({
        "id": entry.id,
        "amount": entry.amount,
        "type": entry.entry_type,
        "relatedJobId": entry.related_job_id,
        "description": entry.description,
        "createdAt": entry.created_at,
    })
}
