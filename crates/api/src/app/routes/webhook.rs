use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use tracing::{info, warn};

use lumagen_core::GenerationError;
use lumagen_gateway::TaskObservation;
use lumagen_sync::sync_once;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/api/webhooks/provider", post(provider_callback).get(webhook_health))
}

/// Inbound provider callback.
///
/// Validated against the shared secret, then handed to the synchronizer.
/// Responds 200 even when reconciliation fails: the reconciliation sweep
/// covers the gap, and a vendor retry storm helps nobody.
pub async fn provider_callback(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    if let Some(expected) = &services.config.webhook_secret {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        let query_secret = params.get("secret").map(String::as_str);

        if bearer != Some(expected.as_str()) && query_secret != Some(expected.as_str()) {
            warn!("unauthorized provider callback");
            return errors::json_error(StatusCode::UNAUTHORIZED, "unauthorized", "bad secret");
        }
    }

    let payload: dto::WebhookPayload = match serde_json::from_value(body) {
        Ok(payload) => payload,
        Err(e) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                format!("malformed callback: {e}"),
            )
        }
    };
    let payload = payload.flatten();

    let Some(task_id) = payload.task_id.clone().filter(|t| !t.is_empty()) else {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "missing taskId");
    };

    let state = payload.state.as_deref().unwrap_or("");
    let observation = match state {
        "success" => {
            let urls = payload.result_urls.clone().unwrap_or_default();
            if urls.is_empty() {
                // The callback says done but carries no URLs; ask the
                // provider directly instead of trusting it blindly.
                return reconcile_by_poll(&services, &task_id).await;
            }
            TaskObservation::success(urls)
        }
        "fail" | "failed" => TaskObservation::failed(
            payload
                .failure_reason
                .clone()
                .unwrap_or_else(|| "generation failed".to_string()),
        ),
        "waiting" | "queuing" | "queued" => TaskObservation::queued(),
        "generating" | "processing" => TaskObservation::processing(),
        // Unknown or absent state: resolve through a real poll.
        _ => return reconcile_by_poll(&services, &task_id).await,
    };

    match services
        .synchronizer
        .apply_by_task_id(&task_id, &observation)
        .await
    {
        Ok(_) => {
            info!(task_id, state, "provider callback applied");
            ok_response(&task_id, true)
        }
        Err(GenerationError::NotFound) => {
            warn!(task_id, "callback for unknown task");
            ok_response(&task_id, false)
        }
        Err(e) => {
            warn!(task_id, error = %e, "callback sync failed");
            ok_response(&task_id, false)
        }
    }
}

async fn reconcile_by_poll(services: &AppServices, task_id: &str) -> axum::response::Response {
    let job = match services.store.find_by_task_id(task_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            warn!(task_id, "callback for unknown task");
            return ok_response(task_id, false);
        }
        Err(e) => {
            warn!(task_id, error = %e, "callback lookup failed");
            return ok_response(task_id, false);
        }
    };

    let Ok(gateway) = services.router.for_kind(job.kind) else {
        return ok_response(task_id, false);
    };

    match sync_once(gateway.as_ref(), services.synchronizer.as_ref(), &job).await {
        Ok(_) => ok_response(task_id, true),
        Err(e) => {
            warn!(task_id, error = %e, "callback-triggered poll failed");
            ok_response(task_id, false)
        }
    }
}

fn ok_response(task_id: &str, success: bool) -> axum::response::Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "success": success, "taskId": task_id })),
    )
        .into_response()
}

pub async fn webhook_health() -> axum::response::Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "endpoint": "/api/webhooks/provider",
        })),
    )
        .into_response()
}
