//! Reference adapter for the KIE market API.
//!
//! Wire surface:
//! - `POST /api/v1/jobs/createTask`: submit, returns `data.taskId`
//! - `GET /api/v1/jobs/recordInfo?taskId=...`: status, returns
//!   `data.{state, resultJson, failCode, failMsg}`
//!
//! Vendor states map to canonical ones as `waiting|queuing → queued`,
//! `generating → processing`, `success`, `fail`. The success envelope may
//! carry `code` 0 or 200, as number or string.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use lumagen_core::{GenerationError, GenerationResult, JobState, ProviderTaskId};

use crate::assets::{extract_assets, MediaProbe};
use crate::provider::{ProviderGateway, SubmitRequest, TaskObservation};

#[derive(Debug, Clone)]
pub struct KieConfig {
    pub api_key: String,
    pub base_url: String,
}

impl KieConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: "https://api.kie.ai".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// KIE market API gateway.
pub struct KieGateway {
    config: KieConfig,
    client: reqwest::Client,
    probe: Arc<dyn MediaProbe>,
}

impl KieGateway {
    pub fn new(config: KieConfig, probe: Arc<dyn MediaProbe>) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            probe,
        }
    }

    async fn poll_single(&self, task_id: &str) -> GenerationResult<TaskObservation> {
        let url = format!(
            "{}/api/v1/jobs/recordInfo?taskId={}",
            self.config.base_url, task_id
        );
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(request_error)?;

        let envelope = read_envelope(response).await?;
        let data = envelope.data.unwrap_or(Value::Null);

        let state = data.get("state").and_then(Value::as_str).unwrap_or("");
        match map_state(state) {
            JobState::Queued => Ok(TaskObservation::queued()),
            JobState::Processing => Ok(TaskObservation::processing()),
            JobState::Failed => {
                let reason = data
                    .get("failMsg")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        let code = data
                            .get("failCode")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown");
                        format!("generation failed (code: {code})")
                    });
                Ok(TaskObservation::failed(reason))
            }
            JobState::Success => {
                let result = parse_result_json(&data);
                let assets = extract_assets(&result, self.probe.as_ref()).await;
                if assets.is_empty() {
                    debug!(task_id, "success with no usable result assets");
                    return Ok(TaskObservation::failed("no results returned by provider"));
                }
                Ok(TaskObservation::success(assets))
            }
        }
    }
}

#[async_trait]
impl ProviderGateway for KieGateway {
    fn name(&self) -> &str {
        "kie"
    }

    #[instrument(skip(self, request), fields(model = %request.model, kind = %request.kind))]
    async fn submit(&self, request: &SubmitRequest) -> GenerationResult<ProviderTaskId> {
        let url = format!("{}/api/v1/jobs/createTask", self.config.base_url);
        let mut body = serde_json::json!({
            "model": request.model,
            "input": request.input,
        });
        if let Some(callback) = &request.callback_url {
            body["callBackUrl"] = Value::String(callback.clone());
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let envelope = read_envelope(response).await?;
        let task_id = envelope
            .data
            .as_ref()
            .and_then(|d| d.get("taskId"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                GenerationError::provider_unavailable("createTask response missing taskId")
            })?;

        debug!(task_id, "task created");
        Ok(ProviderTaskId::new(task_id))
    }

    async fn poll(&self, task_id: &ProviderTaskId) -> GenerationResult<TaskObservation> {
        if !task_id.is_composite() {
            return self.poll_single(task_id.as_str()).await;
        }

        let mut parts = Vec::new();
        for sub_id in task_id.sub_ids() {
            parts.push(self.poll_single(sub_id).await?);
        }
        Ok(TaskObservation::join(&parts))
    }
}

struct Envelope {
    data: Option<Value>,
}

/// Vendor state → canonical state. Unknown states read as still-processing:
/// absence of evidence is not evidence of failure.
fn map_state(state: &str) -> JobState {
    match state {
        "waiting" | "queuing" => JobState::Queued,
        "success" => JobState::Success,
        "fail" => JobState::Failed,
        _ => JobState::Processing,
    }
}

/// `resultJson` is a JSON string inside the payload; when it does not parse,
/// the raw string itself is the only candidate we have.
fn parse_result_json(data: &Value) -> Value {
    match data.get("resultJson") {
        Some(Value::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => data.clone(),
    }
}

fn envelope_code_ok(code: &Value) -> bool {
    match code {
        Value::Number(n) => n.as_i64() == Some(0) || n.as_i64() == Some(200),
        Value::String(s) => s == "0" || s == "200",
        _ => false,
    }
}

fn envelope_message(json: &Value) -> String {
    for field in ["msg", "message", "error"] {
        if let Some(m) = json.get(field).and_then(Value::as_str) {
            if !m.is_empty() {
                return m.to_string();
            }
        }
    }
    "provider returned an error envelope".to_string()
}

fn request_error(err: reqwest::Error) -> GenerationError {
    GenerationError::provider_unavailable(err.to_string())
}

async fn read_envelope(response: reqwest::Response) -> GenerationResult<Envelope> {
    let status = response.status();
    let text = response.text().await.map_err(request_error)?;

    if !status.is_success() {
        let snippet: String = text.chars().take(200).collect();
        return Err(map_http_status(status, snippet));
    }

    let json: Value = serde_json::from_str(&text).map_err(|_| {
        let snippet: String = text.chars().take(200).collect();
        GenerationError::provider_unavailable(format!("invalid JSON from provider: {snippet}"))
    })?;

    let code = json.get("code").cloned().unwrap_or(Value::Null);
    if !envelope_code_ok(&code) {
        return Err(GenerationError::provider_rejected(format!(
            "{} (code: {})",
            envelope_message(&json),
            code
        )));
    }

    Ok(Envelope {
        data: json.get("data").cloned(),
    })
}

fn map_http_status(status: reqwest::StatusCode, body: String) -> GenerationError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        GenerationError::provider_unavailable(format!("provider returned {status}: {body}"))
    } else if status == reqwest::StatusCode::BAD_REQUEST
        || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
    {
        GenerationError::validation(format!("provider rejected input ({status}): {body}"))
    } else {
        GenerationError::provider_rejected(format!("provider returned {status}: {body}"))
    }
}
