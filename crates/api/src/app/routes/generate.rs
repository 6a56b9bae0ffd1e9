use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use lumagen_core::JobKind;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::middleware::AuthContext;

pub fn router() -> Router {
    Router::new().route("/api/generate", post(create_generation))
}

pub async fn create_generation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<dto::GenerateRequest>,
) -> axum::response::Response {
    let kind = match body.kind.parse::<JobKind>() {
        Ok(kind) => kind,
        Err(e) => return errors::generation_error_to_response(&e),
    };
    let model = body.model.clone();
    let input = match body.into_input() {
        Ok(input) => input,
        Err(resp) => return resp,
    };

    match services
        .orchestrator
        .submit(auth.user_id, kind, &model, input)
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(dto::job_to_status_json(&job))).into_response(),
        Err(e) => errors::generation_error_to_response(&e),
    }
}
