use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use lumagen_credits::EntryType;
use lumagen_resilience::BreakerPhase;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::middleware::AuthContext;

pub fn router() -> Router {
    Router::new()
        .route("/api/admin/circuits", get(list_circuits))
        .route("/api/admin/circuits/reset", post(reset_circuits))
        .route("/api/admin/credits/grant", post(grant_credits))
}

fn require_admin(auth: &AuthContext) -> Result<(), axum::response::Response> {
    if auth.is_admin() {
        Ok(())
    } else {
        Err(errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "admin role required",
        ))
    }
}

fn phase_str(phase: BreakerPhase) -> &'static str {
    match phase {
        BreakerPhase::Closed => "closed",
        BreakerPhase::Open => "open",
        BreakerPhase::HalfOpen => "half_open",
    }
}

pub async fn list_circuits(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&auth) {
        return resp;
    }

    let items: Vec<_> = services
        .breakers
        .snapshots()
        .into_iter()
        .map(|s| {
            serde_json::json!({
                "key": s.key,
                "phase": phase_str(s.phase),
                "consecutiveFailures": s.consecutive_failures,
                "trips": s.trips,
                "retryInMs": s.retry_in.map(|d| d.as_millis() as u64),
            })
        })
        .collect();

    (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
}

pub async fn reset_circuits(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<dto::CircuitResetRequest>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&auth) {
        return resp;
    }

    match body.key {
        Some(key) => {
            if !services.breakers.reset(&key) {
                return errors::json_error(
                    StatusCode::NOT_FOUND,
                    "not_found",
                    format!("no circuit for key {key}"),
                );
            }
            info!(key, "circuit reset by admin");
            (StatusCode::OK, Json(serde_json::json!({ "reset": key }))).into_response()
        }
        None => {
            services.breakers.reset_all();
            info!("all circuits reset by admin");
            (StatusCode::OK, Json(serde_json::json!({ "reset": "all" }))).into_response()
        }
    }
}

pub async fn grant_credits(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<dto::GrantCreditsRequest>,
) -> axum::response::Response {
    if let Err(resp) = require_admin(&auth) {
        return resp;
    }

    let description = body
        .description
        .unwrap_or_else(|| "manual grant".to_string());

    match services
        .ledger
        .grant(body.user_id, body.amount, EntryType::AdminGrant, &description)
        .await
    {
        Ok(balance) => (
            StatusCode::OK,
            Json(serde_json::json!({ "balance": balance })),
        )
            .into_response(),
        Err(e) => errors::generation_error_to_response(&e),
    }
}
