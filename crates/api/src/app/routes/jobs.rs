use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tracing::debug;

use lumagen_core::JobId;
use lumagen_sync::sync_once;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::middleware::AuthContext;

pub fn router() -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(50)
        .min(200);

    match services.store.list_for_user(auth.user_id, limit).await {
        Ok(jobs) => {
            let items: Vec<_> = jobs.iter().map(dto::job_to_status_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::generation_error_to_response(&e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match JobId::from_str(&id) {
        Ok(id) => id,
        Err(e) => return errors::generation_error_to_response(&e),
    };

    let Some(mut job) = (match services.store.get(job_id).await {
        Ok(job) => job,
        Err(e) => return errors::generation_error_to_response(&e),
    }) else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found");
    };

    // Jobs are private; admins can inspect any of them.
    if job.user_id != auth.user_id && !auth.is_admin() {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found");
    }

    // Status reads double as an on-demand sync: a job the poll loop gave up
    // on still converges when the user checks on it.
    if !job.is_terminal() && job.provider_task_id.is_some() {
        if let Ok(gateway) = services.router.for_kind(job.kind) {
            if let Err(e) =
                sync_once(gateway.as_ref(), services.synchronizer.as_ref(), &job).await
            {
                debug!(job_id = %job.id, error = %e, "on-demand sync failed");
            }
            if let Ok(Some(refreshed)) = services.store.get(job_id).await {
                job = refreshed;
            }
        }
    }

    (StatusCode::OK, Json(dto::job_to_status_json(&job))).into_response()
}
